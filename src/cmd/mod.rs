//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `run`      | `Run`            |
//! | `workflow` | `Workflow`       |
//! | `config`   | `Config`         |

pub mod config;
pub mod run;
pub mod workflow;

pub use config::cmd_config;
pub use run::cmd_run;
pub use workflow::cmd_workflow;
