//! # Panel Rendering
//!
//! Derived variables computed over a finished panel. The panel rows are
//! loaded into a store relation and each variable becomes a nullable REAL
//! column filled cell by cell from the offer and click relations, followed by
//! optional mean imputation.
//!
//! - `data_set` - Panel relation and its axes
//! - `space_selector` - Sub-space selection and render strategies
//! - `variable` - Variable definitions and the renderer
//! - `imputation` - Mean imputation strategies

pub mod data_set;
pub mod imputation;
pub mod space_selector;
pub mod variable;

pub use data_set::{Axis, PanelDataSet};
pub use imputation::{MeanImputationStrategy, MeanImputer};
pub use space_selector::{validate_selection_space, AxisSelection, RenderStrategy, SpaceSelector};
pub use variable::{RenderReport, Variable, VariableRenderer, VariableSource};
