//! # cryofold-core
//!
//! Geometry and featurization shared by the CryoFold model:
//!
//! - [`residue_constants`]: residue types, atom layouts and rigid-group geometry
//! - [`rigid`]: rotation/translation frames over candle tensors
//! - [`feats`]: pseudo-beta, atom14/atom37 conversion, template and extra-MSA features,
//!   torsion angles to atom coordinates, density registration
//! - [`templates`]: template hits to template features
//! - [`batch`]: the [`FeatureBatch`](batch::FeatureBatch) container
//! - [`metrics`]: lDDT, dRMSD, GDT and superimposition
pub mod batch;
pub mod feats;
pub mod metrics;
pub mod residue_constants;
pub mod rigid;
pub mod templates;

pub use batch::{FeatureBatch, FeatureError};
pub use rigid::{Rigid, Rotation};
