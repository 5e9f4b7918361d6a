//! AWS error classification.
//!
//! Every SDK failure is mapped onto [`ProviderError`] using the error
//! `.code()` rather than string matching on the Debug format, so retry
//! and recovery decisions upstream stay provider-agnostic.

use crate::error::ProviderError;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};

/// Known codes for "not found" conditions across the services in use.
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidVpcID.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidInternetGatewayID.NotFound",
    "InvalidRouteTableID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidPermission.NotFound",
    "InvalidLaunchTemplateId.NotFound",
    "InvalidLaunchTemplateName.NotFoundException",
    "NoSuchEntity",
    "LoadBalancerNotFound",
    "TargetGroupNotFound",
    "ListenerNotFound",
];

/// Known codes for "already exists" conditions.
const ALREADY_EXISTS_CODES: &[&str] = &[
    "InvalidGroup.Duplicate",
    "InvalidPermission.Duplicate",
    "EntityAlreadyExists",
    "InvalidLaunchTemplateName.AlreadyExistsException",
    "DuplicateTargetGroupName",
    "DuplicateLoadBalancerName",
    "DuplicateListener",
    "AlreadyExists",
    "AlreadyExistsException",
];

/// Known codes for throttling and rate limiting.
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

/// Known codes for resources still referenced by dependents.
const DEPENDENCY_CODES: &[&str] = &[
    "DependencyViolation",
    "ResourceInUse",
    "ResourceInUseException",
    "DeleteConflict",
];

/// Classify a raw AWS error code and message.
pub fn classify(code: Option<&str>, message: &str) -> ProviderError {
    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => ProviderError::NotFound(message.to_string()),
        Some("ValidationError") if message.contains("not found") => {
            // Auto Scaling reports a missing group this way
            ProviderError::NotFound(message.to_string())
        }
        Some(c) if ALREADY_EXISTS_CODES.contains(&c) => ProviderError::AlreadyExists,
        Some(c) if THROTTLING_CODES.contains(&c) => ProviderError::Transient {
            code: Some(c.to_string()),
            message: message.to_string(),
        },
        Some(c) if DEPENDENCY_CODES.contains(&c) => {
            ProviderError::DependencyViolation(message.to_string())
        }
        // IAM entities take a moment to become visible to EC2
        Some("InvalidParameterValue") if message.contains("iamInstanceProfile") => {
            ProviderError::Transient {
                code: Some("InvalidParameterValue".to_string()),
                message: message.to_string(),
            }
        }
        Some(_) if message.contains("Invalid IAM Instance Profile") => ProviderError::Transient {
            code: code.map(str::to_string),
            message: message.to_string(),
        },
        _ => ProviderError::Api {
            code: code.map(str::to_string),
            message: message.to_string(),
        },
    }
}

/// Classify any SDK operation error. Transport-level failures (dispatch,
/// timeout) are transient; service errors are classified by code.
pub fn classify_sdk<E>(err: SdkError<E>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return ProviderError::Transient {
            code: None,
            message: err.to_string(),
        };
    }

    let code = err.code().map(str::to_string);
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    classify(code.as_deref(), &message)
}
