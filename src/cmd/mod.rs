//! CLI command implementations.
//!
//! | Module   | Commands handled                                   |
//! |----------|-----------------------------------------------------|
//! | `remote` | `Setup`, `Deploy`, `List`, `TestConnection`        |
//! | `doctor` | `Doctor`                                           |
//! | `host`   | `Host`                                             |
//! | `config` | `Config`                                           |
//! | `jsx`    | `Jsx`                                              |

pub mod config;
pub mod doctor;
pub mod host;
pub mod jsx;
pub mod remote;

pub use config::cmd_config;
pub use doctor::cmd_doctor;
pub use host::{cmd_host, open_hosting};
pub use jsx::cmd_jsx;
pub use remote::{DeployOptions, cmd_deploy, cmd_list, cmd_setup, cmd_test_connection};
