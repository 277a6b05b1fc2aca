pub mod client;
pub mod remote;

/// Default user agent for `kubemirror` - automatically uses the package version
///
/// All client creation should go through `client::new` so mirror traffic is
/// identifiable in apiserver audit logs.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
