// MIT License
// Copyright 2023--present exttool developers

//! Element symbol ⇄ atomic number mapping.

const SYMBOLS: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk",
    "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh",
    "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Atomic number of `symbol`, matched case-insensitively.
///
/// A bare integer label (`"8"`) is accepted as an atomic number.
pub fn atomic_number(symbol: &str) -> Option<u32> {
    let symbol = symbol.trim();
    if let Ok(z) = symbol.parse::<u32>() {
        return (1..=SYMBOLS.len() as u32).contains(&z).then_some(z);
    }
    SYMBOLS
        .iter()
        .position(|s| s.eq_ignore_ascii_case(symbol))
        .map(|i| i as u32 + 1)
}

/// Canonical symbol for atomic number `z`.
pub fn symbol(z: u32) -> Option<&'static str> {
    SYMBOLS.get((z as usize).checked_sub(1)?).copied()
}

/// Canonical spelling of a user-supplied element label (`"cl"` → `"Cl"`).
pub fn normalize(label: &str) -> Option<&'static str> {
    atomic_number(label).and_then(symbol)
}
