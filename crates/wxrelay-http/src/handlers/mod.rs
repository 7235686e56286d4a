//! Request handlers, one module per concern:
//! - `status`: session and group directory views
//! - `settings`: blockedGroups read and password-gated write
//! - `console`: the operator page

pub mod console;
pub mod settings;
pub mod status;
