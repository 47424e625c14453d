//! Acquisition and summary pipeline for the Bank of Russia's credit
//! institution reporting forms (101, 102, 123, 135).

#[macro_use]
extern crate lazy_static;

pub mod banks;
pub mod config;
pub mod dbf;
pub mod error;
pub mod eval;
pub mod extract;
pub mod fetch;
pub mod formulas;
pub mod index;
pub mod output;
pub mod periods;
pub mod pipeline;
pub mod scratch;

pub use config::FormConfig;
pub use error::{Result, RunError};
pub use output::{LongRow, WideTable};
pub use pipeline::{run_form, CancelToken, FormContext, FormOutcome};
