// Security module for plugin path validation and caller authorization
//
// Script plugins are confined to a configured root directory, and every
// tool-scoped request passes an authorization check before it reaches a tool.

pub mod auth;
pub mod path_validator;

pub use auth::{AllowAll, Authorizer, CallerIdentity, PolicyAuthorizer, PolicyError, SharedAuthorizer};
pub use path_validator::{validate_path, PathSecurityError};
