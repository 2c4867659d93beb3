pub mod attach;
pub mod driver;
pub mod exec;
pub mod transfer;

pub use attach::Integrator;
pub use driver::DriverExt;
pub use exec::{ExternalOutcome, TimeoutBucket, run_command, run_shell};
pub use transfer::{TransferOptions, TransferReport, transfer};
