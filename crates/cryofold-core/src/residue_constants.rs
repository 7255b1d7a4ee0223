//! # Residue Constants
//!
//! Fixed per-residue-type geometry used to turn frames and torsion angles into
//! atom coordinates:
//!
//! - the 20 standard residue types (plus `UNK`) in the canonical `ARNDCQEGHILKMFPSTWYV` order
//! - the 37-slot superset atom layout and the per-residue 14-slot layout
//! - literature positions of each heavy atom inside one of 8 rigid groups
//!   (backbone, pre-omega, phi, psi, chi1..chi4)
//! - the default frame of every rigid group relative to its parent
//!
//! The tables are plain Rust arrays; [`ResidueConstants`] derives the index maps and
//! default frames from them and hands them out as candle tensors.
use candle_core::{Device, Result, Tensor};
use nalgebra::{Matrix4, Vector3};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

pub const RESTYPE_NUM: usize = 20;
pub const RESTYPE_WITH_X: usize = 21;
pub const ATOM_TYPE_NUM: usize = 37;
pub const ATOM14_NUM: usize = 14;
pub const RIGID_GROUP_NUM: usize = 8;

/// Residue type index of glycine in the canonical order.
pub const GLY_INDEX: u32 = 7;

pub const N_ATOM: usize = 0;
pub const CA_ATOM: usize = 1;
pub const C_ATOM: usize = 2;
pub const CB_ATOM: usize = 3;
pub const O_ATOM: usize = 4;

#[rustfmt::skip]
pub const RESTYPES: [char; RESTYPE_NUM] = [
    'A', 'R', 'N', 'D', 'C', 'Q', 'E', 'G', 'H', 'I',
    'L', 'K', 'M', 'F', 'P', 'S', 'T', 'W', 'Y', 'V',
];

#[rustfmt::skip]
pub const ATOM_TYPES: [&str; ATOM_TYPE_NUM] = [
    "N", "CA", "C", "CB", "O", "CG", "CG1", "CG2", "OG", "OG1", "SG", "CD",
    "CD1", "CD2", "ND1", "ND2", "OD1", "OD2", "SD", "CE", "CE1", "CE2", "CE3",
    "NE", "NE1", "NE2", "OE1", "OE2", "CH2", "NH1", "NH2", "OH", "CZ", "CZ2",
    "CZ3", "NZ", "OXT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Restype {
    ALA, ARG, ASN, ASP, CYS, GLN, GLU, GLY, HIS, ILE,
    LEU, LYS, MET, PHE, PRO, SER, THR, TRP, TYR, VAL,
    UNK,
}

impl Restype {
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_one_letter(aa: char) -> Self {
        RESTYPES
            .iter()
            .position(|&c| c == aa.to_ascii_uppercase())
            .and_then(|idx| Restype::iter().nth(idx))
            .unwrap_or(Restype::UNK)
    }

    pub fn one_letter(&self) -> char {
        RESTYPES.get(self.index()).copied().unwrap_or('X')
    }
}

pub fn atom_order(name: &str) -> Option<usize> {
    ATOM_TYPES.iter().position(|&a| a == name)
}

#[rustfmt::skip]
pub const ATOM14_NAMES: [[&str; ATOM14_NUM]; RESTYPE_WITH_X] = [
    ["N", "CA", "C", "O", "CB", "", "", "", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "CD", "NE", "CZ", "NH1", "NH2", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "OD1", "ND2", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "OD1", "OD2", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "SG", "", "", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "CD", "OE1", "NE2", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "CD", "OE1", "OE2", "", "", "", "", ""],
    ["N", "CA", "C", "O", "", "", "", "", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "ND1", "CD2", "CE1", "NE2", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG1", "CG2", "CD1", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "CD1", "CD2", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "CD", "CE", "NZ", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "SD", "CE", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "CD1", "CD2", "CE1", "CE2", "CZ", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "CD", "", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "OG", "", "", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "OG1", "CG2", "", "", "", "", "", "", ""],
    ["N", "CA", "C", "O", "CB", "CG", "CD1", "CD2", "NE1", "CE2", "CE3", "CZ2", "CZ3", "CH2"],
    ["N", "CA", "C", "O", "CB", "CG", "CD1", "CD2", "CE1", "CE2", "CZ", "OH", "", ""],
    ["N", "CA", "C", "O", "CB", "CG1", "CG2", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", "", "", "", "", "", "", ""],
];

#[rustfmt::skip]
pub const CHI_ANGLES_ATOMS: [&[[&str; 4]]; RESTYPE_NUM] = [
    &[],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD"], ["CB", "CG", "CD", "NE"], ["CG", "CD", "NE", "CZ"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "OD1"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "OD1"]],
    &[["N", "CA", "CB", "SG"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD"], ["CB", "CG", "CD", "OE1"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD"], ["CB", "CG", "CD", "OE1"]],
    &[],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "ND1"]],
    &[["N", "CA", "CB", "CG1"], ["CA", "CB", "CG1", "CD1"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD1"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD"], ["CB", "CG", "CD", "CE"], ["CG", "CD", "CE", "NZ"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "SD"], ["CB", "CG", "SD", "CE"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD1"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD"]],
    &[["N", "CA", "CB", "OG"]],
    &[["N", "CA", "CB", "OG1"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD1"]],
    &[["N", "CA", "CB", "CG"], ["CA", "CB", "CG", "CD1"]],
    &[["N", "CA", "CB", "CG1"]],
];

/// Chi angles that are symmetric under a rotation by π (ASP χ2, GLU χ3, PHE χ2, TYR χ2).
#[rustfmt::skip]
pub const CHI_PI_PERIODIC: [[f32; 4]; RESTYPE_WITH_X] = [
    [0., 0., 0., 0.], [0., 0., 0., 0.], [0., 0., 0., 0.], [0., 1., 0., 0.],
    [0., 0., 0., 0.], [0., 0., 0., 0.], [0., 0., 1., 0.], [0., 0., 0., 0.],
    [0., 0., 0., 0.], [0., 0., 0., 0.], [0., 0., 0., 0.], [0., 0., 0., 0.],
    [0., 0., 0., 0.], [0., 1., 0., 0.], [0., 0., 0., 0.], [0., 0., 0., 0.],
    [0., 0., 0., 0.], [0., 0., 0., 0.], [0., 1., 0., 0.], [0., 0., 0., 0.],
    [0., 0., 0., 0.],
];

type GroupAtom = (&'static str, usize, [f32; 3]);

// Atom positions relative to the rigid group they belong to.
// Group 0: backbone, 3: psi, 4..=7: chi1..chi4.
#[rustfmt::skip]
pub const RIGID_GROUP_ATOM_POSITIONS: [&[GroupAtom]; RESTYPE_NUM] = [
    // ALA
    &[("N", 0, [-0.525, 1.363, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.526, -0.000, -0.000]), ("CB", 0, [-0.529, -0.774, -1.205]),
      ("O", 3, [0.627, 1.062, 0.000])],
    // ARG
    &[("N", 0, [-0.524, 1.362, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.525, -0.000, -0.000]), ("CB", 0, [-0.524, -0.778, -1.209]),
      ("O", 3, [0.626, 1.062, 0.000]), ("CG", 4, [0.616, 1.390, -0.000]),
      ("CD", 5, [0.564, 1.414, 0.000]), ("NE", 6, [0.539, 1.357, -0.000]),
      ("NH1", 7, [0.206, 2.301, 0.000]), ("NH2", 7, [2.078, 0.978, -0.000]),
      ("CZ", 7, [0.758, 1.093, -0.000])],
    // ASN
    &[("N", 0, [-0.536, 1.357, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.526, -0.000, -0.000]), ("CB", 0, [-0.531, -0.787, -1.200]),
      ("O", 3, [0.625, 1.062, 0.000]), ("CG", 4, [0.584, 1.399, 0.000]),
      ("ND2", 5, [0.593, -1.188, 0.001]), ("OD1", 5, [0.633, 1.059, 0.000])],
    // ASP
    &[("N", 0, [-0.525, 1.362, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.527, 0.000, -0.000]), ("CB", 0, [-0.526, -0.778, -1.208]),
      ("O", 3, [0.626, 1.062, -0.000]), ("CG", 4, [0.593, 1.398, -0.000]),
      ("OD1", 5, [0.610, 1.091, 0.000]), ("OD2", 5, [0.592, -1.101, -0.003])],
    // CYS
    &[("N", 0, [-0.522, 1.362, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.524, 0.000, 0.000]), ("CB", 0, [-0.519, -0.773, -1.212]),
      ("O", 3, [0.625, 1.062, -0.000]), ("SG", 4, [0.728, 1.653, 0.000])],
    // GLN
    &[("N", 0, [-0.526, 1.361, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.526, 0.000, 0.000]), ("CB", 0, [-0.525, -0.779, -1.207]),
      ("O", 3, [0.626, 1.062, -0.000]), ("CG", 4, [0.615, 1.393, 0.000]),
      ("CD", 5, [0.587, 1.399, -0.000]), ("NE2", 6, [0.593, -1.189, -0.001]),
      ("OE1", 6, [0.634, 1.060, 0.000])],
    // GLU
    &[("N", 0, [-0.528, 1.361, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.526, -0.000, -0.000]), ("CB", 0, [-0.526, -0.781, -1.207]),
      ("O", 3, [0.626, 1.062, 0.000]), ("CG", 4, [0.615, 1.392, 0.000]),
      ("CD", 5, [0.600, 1.397, 0.000]), ("OE1", 6, [0.607, 1.095, -0.000]),
      ("OE2", 6, [0.589, -1.104, -0.001])],
    // GLY
    &[("N", 0, [-0.572, 1.337, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.517, -0.000, -0.000]), ("O", 3, [0.626, 1.062, -0.000])],
    // HIS
    &[("N", 0, [-0.527, 1.360, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.525, 0.000, 0.000]), ("CB", 0, [-0.525, -0.778, -1.208]),
      ("O", 3, [0.625, 1.063, 0.000]), ("CG", 4, [0.600, 1.370, -0.000]),
      ("CD2", 5, [0.889, -1.021, 0.003]), ("ND1", 5, [0.744, 1.160, -0.000]),
      ("CE1", 5, [2.030, 0.851, 0.002]), ("NE2", 5, [2.145, -0.466, 0.004])],
    // ILE
    &[("N", 0, [-0.493, 1.373, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.527, -0.000, -0.000]), ("CB", 0, [-0.536, -0.793, -1.213]),
      ("O", 3, [0.627, 1.062, -0.000]), ("CG1", 4, [0.534, 1.437, -0.000]),
      ("CG2", 4, [0.540, -0.785, -1.199]), ("CD1", 5, [0.619, 1.391, 0.000])],
    // LEU
    &[("N", 0, [-0.520, 1.363, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.525, -0.000, -0.000]), ("CB", 0, [-0.522, -0.773, -1.214]),
      ("O", 3, [0.625, 1.063, -0.000]), ("CG", 4, [0.678, 1.371, 0.000]),
      ("CD1", 5, [0.530, 1.430, -0.000]), ("CD2", 5, [0.535, -0.774, 1.200])],
    // LYS
    &[("N", 0, [-0.526, 1.362, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.526, 0.000, 0.000]), ("CB", 0, [-0.524, -0.778, -1.208]),
      ("O", 3, [0.626, 1.062, -0.000]), ("CG", 4, [0.619, 1.390, 0.000]),
      ("CD", 5, [0.559, 1.417, 0.000]), ("CE", 6, [0.560, 1.416, 0.000]),
      ("NZ", 7, [0.554, 1.387, 0.000])],
    // MET
    &[("N", 0, [-0.521, 1.364, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.525, 0.000, 0.000]), ("CB", 0, [-0.523, -0.776, -1.210]),
      ("O", 3, [0.625, 1.062, -0.000]), ("CG", 4, [0.613, 1.391, -0.000]),
      ("SD", 5, [0.703, 1.695, 0.000]), ("CE", 6, [0.320, 1.786, -0.000])],
    // PHE
    &[("N", 0, [-0.518, 1.363, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.524, 0.000, -0.000]), ("CB", 0, [-0.525, -0.776, -1.212]),
      ("O", 3, [0.626, 1.062, -0.000]), ("CG", 4, [0.607, 1.377, 0.000]),
      ("CD1", 5, [0.709, 1.195, -0.000]), ("CD2", 5, [0.706, -1.196, 0.000]),
      ("CE1", 5, [2.102, 1.198, -0.000]), ("CE2", 5, [2.098, -1.201, -0.000]),
      ("CZ", 5, [2.794, -0.003, -0.001])],
    // PRO
    &[("N", 0, [-0.566, 1.351, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.527, -0.000, 0.000]), ("CB", 0, [-0.546, -0.611, -1.293]),
      ("O", 3, [0.621, 1.066, 0.000]), ("CG", 4, [0.382, 1.445, 0.0]),
      ("CD", 5, [0.477, 1.424, 0.0])],
    // SER
    &[("N", 0, [-0.529, 1.360, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.525, -0.000, -0.000]), ("CB", 0, [-0.518, -0.777, -1.211]),
      ("O", 3, [0.626, 1.062, -0.000]), ("OG", 4, [0.503, 1.325, 0.000])],
    // THR
    &[("N", 0, [-0.517, 1.364, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.526, 0.000, -0.000]), ("CB", 0, [-0.516, -0.793, -1.215]),
      ("O", 3, [0.626, 1.062, 0.000]), ("CG2", 4, [0.550, -0.718, -1.228]),
      ("OG1", 4, [0.472, 1.353, 0.000])],
    // TRP
    &[("N", 0, [-0.521, 1.363, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.525, -0.000, 0.000]), ("CB", 0, [-0.523, -0.776, -1.212]),
      ("O", 3, [0.627, 1.062, 0.000]), ("CG", 4, [0.609, 1.370, -0.000]),
      ("CD1", 5, [0.824, 1.091, 0.000]), ("CD2", 5, [0.854, -1.148, -0.005]),
      ("CE2", 5, [2.186, -0.678, -0.007]), ("CE3", 5, [0.622, -2.530, -0.007]),
      ("NE1", 5, [2.140, 0.690, -0.004]), ("CH2", 5, [3.028, -2.890, -0.013]),
      ("CZ2", 5, [3.283, -1.543, -0.011]), ("CZ3", 5, [1.715, -3.389, -0.011])],
    // TYR
    &[("N", 0, [-0.522, 1.362, 0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.524, -0.000, -0.000]), ("CB", 0, [-0.522, -0.776, -1.213]),
      ("O", 3, [0.627, 1.062, -0.000]), ("CG", 4, [0.607, 1.382, -0.000]),
      ("CD1", 5, [0.716, 1.195, -0.000]), ("CD2", 5, [0.713, -1.194, -0.001]),
      ("CE1", 5, [2.107, 1.200, -0.002]), ("CE2", 5, [2.104, -1.201, -0.003]),
      ("OH", 5, [4.168, -0.002, -0.005]), ("CZ", 5, [2.791, -0.001, -0.003])],
    // VAL
    &[("N", 0, [-0.494, 1.373, -0.000]), ("CA", 0, [0.000, 0.000, 0.000]),
      ("C", 0, [1.527, -0.000, -0.000]), ("CB", 0, [-0.533, -0.795, -1.213]),
      ("O", 3, [0.627, 1.062, -0.000]), ("CG1", 4, [0.540, 1.429, -0.000]),
      ("CG2", 4, [0.533, -0.776, 1.203])],
];

/// Index maps, masks and rigid-group geometry for every residue type.
///
/// Row 20 (`UNK`) has no atoms and identity frames.
#[derive(Clone, Debug)]
pub struct ResidueConstants {
    pub atom14_to_atom37: Vec<[u32; ATOM14_NUM]>,
    pub atom37_to_atom14: Vec<[u32; ATOM_TYPE_NUM]>,
    pub atom14_mask: Vec<[f32; ATOM14_NUM]>,
    pub atom37_mask: Vec<[f32; ATOM_TYPE_NUM]>,
    pub atom14_group_idx: Vec<[u32; ATOM14_NUM]>,
    pub atom14_lit_positions: Vec<[[f32; 3]; ATOM14_NUM]>,
    pub default_frames: Vec<[Matrix4<f32>; RIGID_GROUP_NUM]>,
    pub chi_angles_mask: Vec<[f32; 4]>,
}

impl Default for ResidueConstants {
    fn default() -> Self {
        Self::new()
    }
}

impl ResidueConstants {
    pub fn new() -> Self {
        let mut atom14_to_atom37 = vec![[0u32; ATOM14_NUM]; RESTYPE_WITH_X];
        let mut atom37_to_atom14 = vec![[0u32; ATOM_TYPE_NUM]; RESTYPE_WITH_X];
        let mut atom14_mask = vec![[0f32; ATOM14_NUM]; RESTYPE_WITH_X];
        let mut atom37_mask = vec![[0f32; ATOM_TYPE_NUM]; RESTYPE_WITH_X];

        for (restype, names) in ATOM14_NAMES.iter().enumerate() {
            for (slot, name) in names.iter().enumerate() {
                if name.is_empty() {
                    continue;
                }
                if let Some(idx37) = atom_order(name) {
                    atom14_to_atom37[restype][slot] = idx37 as u32;
                    atom37_to_atom14[restype][idx37] = slot as u32;
                    atom14_mask[restype][slot] = 1.0;
                    atom37_mask[restype][idx37] = 1.0;
                }
            }
        }

        let mut chi_angles_mask = vec![[0f32; 4]; RESTYPE_WITH_X];
        for (restype, chis) in CHI_ANGLES_ATOMS.iter().enumerate() {
            for chi in 0..chis.len() {
                chi_angles_mask[restype][chi] = 1.0;
            }
        }

        let mut atom14_group_idx = vec![[0u32; ATOM14_NUM]; RESTYPE_WITH_X];
        let mut atom14_lit_positions = vec![[[0f32; 3]; ATOM14_NUM]; RESTYPE_WITH_X];
        for (restype, atoms) in RIGID_GROUP_ATOM_POSITIONS.iter().enumerate() {
            for (name, group, pos) in atoms.iter() {
                if let Some(slot) = ATOM14_NAMES[restype].iter().position(|n| n == name) {
                    atom14_group_idx[restype][slot] = *group as u32;
                    atom14_lit_positions[restype][slot] = *pos;
                }
            }
        }

        let mut default_frames = vec![[Matrix4::<f32>::identity(); RIGID_GROUP_NUM]; RESTYPE_WITH_X];
        for restype in 0..RESTYPE_NUM {
            default_frames[restype] = rigid_group_default_frames(restype, &chi_angles_mask[restype]);
        }

        Self {
            atom14_to_atom37,
            atom37_to_atom14,
            atom14_mask,
            atom37_mask,
            atom14_group_idx,
            atom14_lit_positions,
            default_frames,
            chi_angles_mask,
        }
    }

    /// `[21, 37]` gather indices from atom14 slots into the atom37 layout.
    pub fn atom37_to_atom14_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self.atom37_to_atom14.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (RESTYPE_WITH_X, ATOM_TYPE_NUM), device)
    }

    pub fn atom14_to_atom37_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self.atom14_to_atom37.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (RESTYPE_WITH_X, ATOM14_NUM), device)
    }

    pub fn atom14_mask_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = self.atom14_mask.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (RESTYPE_WITH_X, ATOM14_NUM), device)
    }

    pub fn atom37_mask_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = self.atom37_mask.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (RESTYPE_WITH_X, ATOM_TYPE_NUM), device)
    }

    pub fn group_idx_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self.atom14_group_idx.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (RESTYPE_WITH_X, ATOM14_NUM), device)
    }

    /// `[21, 14, 3]`
    pub fn lit_positions_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = self
            .atom14_lit_positions
            .iter()
            .flat_map(|atoms| atoms.iter().flatten().copied())
            .collect();
        Tensor::from_vec(flat, (RESTYPE_WITH_X, ATOM14_NUM, 3), device)
    }

    /// `[21, 8, 4, 4]` homogeneous transforms, row-major.
    pub fn default_frames_tensor(&self, device: &Device) -> Result<Tensor> {
        let mut flat = Vec::with_capacity(RESTYPE_WITH_X * RIGID_GROUP_NUM * 16);
        for frames in self.default_frames.iter() {
            for m in frames.iter() {
                for r in 0..4 {
                    for c in 0..4 {
                        flat.push(m[(r, c)]);
                    }
                }
            }
        }
        Tensor::from_vec(flat, (RESTYPE_WITH_X, RIGID_GROUP_NUM, 4, 4), device)
    }

    pub fn chi_angles_mask_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = self.chi_angles_mask.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (RESTYPE_WITH_X, 4), device)
    }

    pub fn chi_pi_periodic_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = CHI_PI_PERIODIC.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (RESTYPE_WITH_X, 4), device)
    }
}

fn group_positions(restype: usize) -> impl Fn(&str) -> Vector3<f32> {
    let atoms = RIGID_GROUP_ATOM_POSITIONS[restype];
    move |name: &str| {
        atoms
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, _, p)| Vector3::new(p[0], p[1], p[2]))
            .unwrap_or_else(Vector3::zeros)
    }
}

fn rigid_group_default_frames(restype: usize, chi_mask: &[f32; 4]) -> [Matrix4<f32>; RIGID_GROUP_NUM] {
    let pos = group_positions(restype);
    let mut frames = [Matrix4::<f32>::identity(); RIGID_GROUP_NUM];

    // phi frame
    frames[2] = make_rigid_transformation_4x4(
        &(pos("N") - pos("CA")),
        &Vector3::new(1.0, 0.0, 0.0),
        &pos("N"),
    );
    // psi frame
    frames[3] = make_rigid_transformation_4x4(
        &(pos("C") - pos("CA")),
        &(pos("CA") - pos("N")),
        &pos("C"),
    );
    // chi1 frame, relative to the backbone
    if chi_mask[0] > 0.0 {
        let base = CHI_ANGLES_ATOMS[restype][0];
        let (p0, p1, p2) = (pos(base[0]), pos(base[1]), pos(base[2]));
        frames[4] = make_rigid_transformation_4x4(&(p2 - p1), &(p0 - p1), &p2);
    }
    // chi2..chi4, each relative to the previous chi frame
    for chi in 1..4 {
        if chi_mask[chi] > 0.0 {
            let axis_end = pos(CHI_ANGLES_ATOMS[restype][chi][2]);
            frames[4 + chi] =
                make_rigid_transformation_4x4(&axis_end, &Vector3::new(-1.0, 0.0, 0.0), &axis_end);
        }
    }
    frames
}

/// Rotation columns are `ex`, the part of `ey` orthogonal to `ex`, and their cross product.
fn make_rigid_transformation_4x4(
    ex: &Vector3<f32>,
    ey: &Vector3<f32>,
    translation: &Vector3<f32>,
) -> Matrix4<f32> {
    let ex = ex.normalize();
    let ey = (ey - ex * ey.dot(&ex)).normalize();
    let ez = ex.cross(&ey);
    let mut m = Matrix4::<f32>::identity();
    for r in 0..3 {
        m[(r, 0)] = ex[r];
        m[(r, 1)] = ey[r];
        m[(r, 2)] = ez[r];
        m[(r, 3)] = translation[r];
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom14_atom37_maps_are_inverse() {
        let rc = ResidueConstants::new();
        for restype in 0..RESTYPE_NUM {
            for slot in 0..ATOM14_NUM {
                if rc.atom14_mask[restype][slot] > 0.0 {
                    let idx37 = rc.atom14_to_atom37[restype][slot] as usize;
                    assert_eq!(rc.atom37_to_atom14[restype][idx37] as usize, slot);
                    assert_eq!(rc.atom37_mask[restype][idx37], 1.0);
                }
            }
        }
        assert_eq!(rc.atom14_mask[RESTYPE_NUM].iter().sum::<f32>(), 0.0);
    }

    #[test]
    fn test_every_atom14_name_has_a_literature_position() {
        for restype in 0..RESTYPE_NUM {
            let n_named = ATOM14_NAMES[restype].iter().filter(|n| !n.is_empty()).count();
            assert_eq!(n_named, RIGID_GROUP_ATOM_POSITIONS[restype].len(), "restype {restype}");
        }
    }

    #[test]
    fn test_default_frames_are_rigid() {
        let rc = ResidueConstants::new();
        for frames in rc.default_frames.iter() {
            for m in frames.iter() {
                let rot = m.fixed_view::<3, 3>(0, 0).into_owned();
                let should_be_identity = rot.transpose() * rot;
                assert!((should_be_identity - nalgebra::Matrix3::identity()).norm() < 1e-5);
                assert!((rot.determinant() - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_restype_lookup() {
        assert_eq!(Restype::from_one_letter('G').index(), GLY_INDEX as usize);
        assert_eq!(Restype::from_one_letter('z'), Restype::UNK);
        assert_eq!(Restype::VAL.one_letter(), 'V');
        assert_eq!("trp".parse::<Restype>().ok(), Some(Restype::TRP));
    }
}
