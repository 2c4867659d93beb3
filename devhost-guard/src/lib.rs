pub mod headers;
pub mod redact;
pub mod ssrf;

pub use redact::Redactor;
pub use ssrf::{BlockReason, UpstreamGuard, classify_invalid_target};
