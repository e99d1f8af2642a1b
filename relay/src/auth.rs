//! Authentication and authorization seams.
//!
//! Token issuing lives in the external auth service; the relay only
//! verifies the bearer credential carried on the upgrade request. Device
//! authorization is a pluggable collaborator consulted before any widget
//! subscription is recorded.

use iotbridge_shared::{verify_jwt, AuthError, Principal};

/// Verifies the opaque bearer credential presented at connection time.
pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// HS256 JWT verification against the configured secret.
pub struct JwtAuthenticator {
    secret: String,
}

impl JwtAuthenticator {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = verify_jwt(token, &self.secret)?;
        Ok(Principal::from(claims))
    }
}

/// Decides whether a principal may subscribe to or command a device.
pub trait DeviceAuthorizer: Send + Sync {
    fn allow(&self, principal: &Principal, device_id: &str) -> bool;
}

/// Default policy: no multi-tenant topic scheme is assumed, every
/// authenticated principal may watch every device.
pub struct AllowAll;

impl DeviceAuthorizer for AllowAll {
    fn allow(&self, _principal: &Principal, _device_id: &str) -> bool {
        true
    }
}
