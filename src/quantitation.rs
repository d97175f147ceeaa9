//! C6: Counts -> mass -> moles -> diameter quantitation (§4.6).

use crate::types::{CalibrationState, IonicCalibration, IsotopeKey, Quantified, VariantName};

/// Avogadro's number.
const AVOGADRO: f64 = 6.02214076e23;

/// Select the ionic-calibration variant to use for `isotope`: the
/// collaborator's preference if fitted, else Weighted -> Simple -> Zero ->
/// Manual, in that order (§4.6 fallback chain).
fn select_variant(cal: &IonicCalibration, preferred: Option<VariantName>) -> Option<(VariantName, crate::types::IonicVariant)> {
    if let Some(name) = preferred {
        if let Some(v) = cal.variant(name) {
            return Some((name, v));
        }
    }
    for name in [VariantName::Weighted, VariantName::Simple, VariantName::Zero, VariantName::Manual] {
        if let Some(v) = cal.variant(name) {
            return Some((name, v));
        }
    }
    None
}

/// Quantify a particle's integrated counts for one isotope. Returns
/// `Quantified::uncalibrated()` whenever the required calibration inputs
/// are missing or non-physical (slope <= 0, transport rate <= 0, no fitted
/// variant) rather than raising an error (§7: Uncalibrated is not an
/// error).
pub fn quantify(total_counts: f64, isotope: &IsotopeKey, calibration_state: &CalibrationState) -> Quantified {
    let Some(cal) = calibration_state.ionic.get(isotope) else {
        return Quantified::uncalibrated();
    };
    let preferred = calibration_state.method_preference.get(isotope).copied();
    let Some((_, variant)) = select_variant(cal, preferred) else {
        return Quantified::uncalibrated();
    };

    let transport_rate_ul_s = calibration_state.transport_rate();
    if variant.slope <= 0.0 || transport_rate_ul_s <= 0.0 || total_counts <= 0.0 {
        return Quantified::uncalibrated();
    }

    // Conversion factor F converts counts directly to element mass in
    // femtograms: R is in uL/s, scaled to mL/s (x1e-3) to match the
    // ng/mL sensitivity convention of `slope`.
    let conversion_factor = variant.slope / (transport_rate_ul_s * 1000.0);
    if conversion_factor <= 0.0 {
        return Quantified::uncalibrated();
    }

    let element_mass_fg = total_counts / conversion_factor;

    if cal.mass_fraction <= 0.0 {
        return Quantified::uncalibrated();
    }
    let compound_mass_fg = element_mass_fg / cal.mass_fraction;

    let moles_fmol = if cal.molecular_weight > 0.0 {
        // compound_mass_fg (1e-15 g) / molecular_weight (g/mol) -> mol, then to fmol (1e-15 mol)
        compound_mass_fg / cal.molecular_weight
    } else if cal.atomic_mass > 0.0 {
        element_mass_fg / cal.atomic_mass
    } else {
        return Quantified::uncalibrated();
    };

    if cal.density <= 0.0 {
        return Quantified::uncalibrated();
    }
    // mass (fg = 1e-15 g) / density (g/cm^3) -> volume (1e-15 cm^3 = 1e-3 nm^3... )
    // volume_cm3 = mass_g / density; diameter from sphere volume.
    let mass_for_diameter_g = compound_mass_fg * 1e-15;
    let volume_cm3 = mass_for_diameter_g / cal.density;
    let volume_nm3 = volume_cm3 * 1e21; // 1 cm^3 = 1e21 nm^3
    let diameter_nm = (6.0 * volume_nm3 / std::f64::consts::PI).cbrt();

    Quantified { uncalibrated: false, element_mass_fg, compound_mass_fg, moles_fmol, diameter_nm }
}

/// Mass-percent and mole-percent composition of a multi-element particle's
/// quantified elements, keyed the same way as `MultiElementParticle`.
pub fn composition_percentages(masses_fg: &[(IsotopeKey, f64)], moles_fmol: &[(IsotopeKey, f64)]) -> (Vec<(IsotopeKey, f64)>, Vec<(IsotopeKey, f64)>) {
    let mass_total: f64 = masses_fg.iter().map(|(_, m)| m).sum();
    let mole_total: f64 = moles_fmol.iter().map(|(_, m)| m).sum();

    let mass_pct = if mass_total > 0.0 {
        masses_fg.iter().map(|(k, m)| (k.clone(), 100.0 * m / mass_total)).collect()
    } else {
        Vec::new()
    };
    let mole_pct = if mole_total > 0.0 {
        moles_fmol.iter().map(|(k, m)| (k.clone(), 100.0 * m / mole_total)).collect()
    } else {
        Vec::new()
    };
    (mass_pct, mole_pct)
}

/// Count of reference for Avogadro's number users outside this module
/// (exposed so a collaborator rendering molar concentrations doesn't need
/// its own constant).
pub fn avogadro() -> f64 {
    AVOGADRO
}
