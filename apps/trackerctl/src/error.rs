use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },
    #[error("invalid configuration: {key} {reason}")]
    ConfigInvalid { key: String, reason: String },
    #[error("unable to obtain elevated privileges: {0}")]
    PrivilegeError(String),
    #[error("timed out waiting for {what} after {attempts} attempts")]
    ProvisionTimeout { what: String, attempts: u32 },
    #[error("transfer failed: {0}")]
    TransferFailure(String),
    #[error("services not ready after {attempts} attempts: {pending}")]
    ServiceTimeout { attempts: u32, pending: String },
    #[error("endpoint check failed: {0}")]
    EndpointFailure(String),
}

impl PipelineError {
    pub fn missing_key(key: &str) -> Self {
        Self::ConfigInvalid {
            key: key.to_string(),
            reason: "is missing or empty".to_string(),
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => Some(
                "Create the environment file from its template and run configure-env",
            ),
            Self::ConfigInvalid { .. } => Some("Fix the environment file and rerun configure-env"),
            Self::PrivilegeError(_) => Some("Run `sudo -v` in a terminal, then retry"),
            Self::ProvisionTimeout { .. } => {
                Some("Inspect the VM console or rerun provision-infrastructure destroy and apply")
            }
            Self::ServiceTimeout { .. } => Some("Run health-check or docker compose logs on the VM"),
            Self::TransferFailure(_) | Self::EndpointFailure(_) => None,
        }
    }
}

pub fn pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn pipeline_error_is_found_below_context() {
        let err = Err::<(), _>(PipelineError::PrivilegeError("denied".to_string()))
            .context("apply failed")
            .unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::PrivilegeError(_))
        ));
        assert!(pipeline_error(&anyhow::anyhow!("plain")).is_none());
    }
}
