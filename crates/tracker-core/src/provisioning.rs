//! Device provisioning request validation. Invalid requests never reach the
//! backend.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationErrors;
use tracker_domain::ProvisionRequest;

/// Something, an `@`, something, a `.`, something; no whitespace
static EMAIL: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\S+@\S+\.\S+$").ok());

/// Trim and check a provisioning request, collecting every problem
///
/// # Errors
///
/// Returns all rejected fields when IMEI or name is blank, or the owner
/// email is present but malformed.
pub fn validate(request: ProvisionRequest) -> Result<ProvisionRequest, ValidationErrors> {
    let mut errors = ValidationErrors::default();

    let imei = request.imei.trim().to_string();
    if imei.is_empty() {
        errors.push("imei", "IMEI is required");
    }

    let name = request.name.trim().to_string();
    if name.is_empty() {
        errors.push("name", "Device name is required");
    }

    let owner_email = request
        .owner_email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());
    if let Some(ref email) = owner_email {
        if !EMAIL.as_ref().is_some_and(|re| re.is_match(email)) {
            errors.push("owner_email", "Invalid email address");
        }
    }

    errors.into_result(ProvisionRequest {
        imei,
        name,
        owner_email,
        device_type: request.device_type,
    })
}
