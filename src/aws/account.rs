//! Caller identity check via STS.
//!
//! Run before touching any resources so a misconfigured credential chain
//! fails fast with a readable error instead of a mid-run access denial.

use super::context::AwsContext;
use anyhow::{Context, Result};
use tracing::info;

#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub account_id: String,
    pub arn: String,
}

/// Resolve and log who we are operating as.
pub async fn verify_credentials(ctx: &AwsContext) -> Result<CallerIdentity> {
    let identity = ctx
        .sts_client()
        .get_caller_identity()
        .send()
        .await
        .context("Failed to resolve caller identity; check AWS credentials")?;

    let account_id = identity
        .account()
        .context("Caller identity did not include an account id")?
        .to_string();
    let arn = identity
        .arn()
        .context("Caller identity did not include an ARN")?
        .to_string();

    info!(account = %account_id, arn = %arn, region = %ctx.region(), "Authenticated");
    Ok(CallerIdentity { account_id, arn })
}
