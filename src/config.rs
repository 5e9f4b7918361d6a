//! Run configuration shared across commands.

use std::path::PathBuf;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_INSTANCE_TYPE: &str = "t3.small";
pub const DEFAULT_APP_PORT: u16 = 8501;
pub const DEFAULT_OUTPUT_FILE: &str = "infrastructure-output.env";

/// How the orchestrator reacts to a failed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort the pass on the first failure; unprocessed specs are skipped
    Strict,
    /// Keep going; dependents of the failure get sentinel identifiers
    #[default]
    BestEffort,
}

/// Everything a reconciliation or teardown run needs to know.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Stack name; prefixes every cloud-side resource name
    pub stack: String,
    pub region: String,
    pub policy: FailurePolicy,
    /// Tear down recreatable resources before reconciling
    pub force_recreate: bool,
    /// Max concurrent operations within a topology layer
    pub concurrency: usize,
    /// Where to write the resolved-identifier artifact
    pub output_file: PathBuf,
}

impl RunConfig {
    pub fn new(stack: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            region: region.into(),
            policy: FailurePolicy::default(),
            force_recreate: false,
            concurrency: 4,
            output_file: PathBuf::from(DEFAULT_OUTPUT_FILE),
        }
    }
}

/// Shape of the standard single-service stack topology.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub key_name: Option<String>,
    pub instance_type: String,
    /// Port the application listens on behind the load balancer
    pub app_port: u16,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    /// AMI to launch; resolved to the latest AL2023 image when absent
    pub image_id: Option<String>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            key_name: None,
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            app_port: DEFAULT_APP_PORT,
            min_size: 1,
            max_size: 3,
            desired_capacity: 1,
            image_id: None,
        }
    }
}
