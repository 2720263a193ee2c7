// Data access role for batch translation
//
// The translation service reads inputs and writes outputs through an IAM role
// trusted by its service principal. The role is resolved or created once per run.

use async_trait::async_trait;
use aws_sdk_iam::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::aws::classify;
use crate::config::TranslateConfig;
use crate::error::{RemoteError, RemoteResult, Result, TransxError};

/// Checks of a freshly created role before giving up.
const RECHECK_ATTEMPTS: u32 = 5;
const RECHECK_DELAY: Duration = Duration::from_secs(2);

#[async_trait]
pub trait AccessRoleApi: Send + Sync {
    /// ARN of role `name`, `NotFound` when it does not exist.
    async fn get_role(&self, name: &str) -> RemoteResult<String>;

    /// Create role `name`; `Conflict` when it already exists.
    async fn create_role(&self, name: &str, trust_policy: &str) -> RemoteResult<String>;

    async fn attach_policy(&self, name: &str, policy_arn: &str) -> RemoteResult<()>;
}

/// Trust policy letting `principal` assume the role.
pub fn trust_policy(principal: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Principal": { "Service": principal },
                "Action": "sts:AssumeRole"
            }
        ]
    })
    .to_string()
}

pub struct IamRoles {
    client: Client,
}

impl IamRoles {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self { client: Client::new(sdk_config) }
    }
}

#[async_trait]
impl AccessRoleApi for IamRoles {
    async fn get_role(&self, name: &str) -> RemoteResult<String> {
        let output = self
            .client
            .get_role()
            .role_name(name)
            .send()
            .await
            .map_err(classify)?;
        output
            .role()
            .map(|role| role.arn().to_string())
            .ok_or_else(|| RemoteError::NotFound(format!("role {}", name)))
    }

    async fn create_role(&self, name: &str, trust_policy: &str) -> RemoteResult<String> {
        let output = self
            .client
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy)
            .description("Data access for transx batch translation")
            .send()
            .await
            .map_err(classify)?;
        output
            .role()
            .map(|role| role.arn().to_string())
            .ok_or_else(|| RemoteError::Invalid(format!("no role returned for {}", name)))
    }

    async fn attach_policy(&self, name: &str, policy_arn: &str) -> RemoteResult<()> {
        self.client
            .attach_role_policy()
            .role_name(name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Resolves the data access role, creating it at most once.
pub struct RoleProvisioner {
    api: Arc<dyn AccessRoleApi>,
    name: String,
    principal: String,
    policy_arn: String,
    arn: OnceCell<String>,
    recheck_attempts: u32,
    recheck_delay: Duration,
}

impl RoleProvisioner {
    pub fn new(api: Arc<dyn AccessRoleApi>, config: &TranslateConfig) -> Self {
        Self {
            api,
            name: config.role_name.clone(),
            principal: config.service_principal.clone(),
            policy_arn: config.policy_arn.clone(),
            arn: OnceCell::new(),
            recheck_attempts: RECHECK_ATTEMPTS,
            recheck_delay: RECHECK_DELAY,
        }
    }

    /// ARN of the role, created with its trust policy and attached policy if missing.
    pub async fn ensure_role(&self) -> Result<String> {
        self.arn
            .get_or_try_init(|| self.resolve_or_create())
            .await
            .cloned()
    }

    async fn resolve_or_create(&self) -> Result<String> {
        match self.api.get_role(&self.name).await {
            Ok(arn) => {
                info!("Role {} found: {}", self.name, arn);
                return Ok(arn);
            }
            Err(RemoteError::NotFound(_)) => info!("Role {} not found, creating it", self.name),
            Err(e) => return Err(TransxError::Setup(format!("cannot read role {}: {}", self.name, e))),
        }

        match self.api.create_role(&self.name, &trust_policy(&self.principal)).await {
            Ok(arn) => debug!("Created role {}", arn),
            Err(RemoteError::Conflict(_)) => info!("Role {} was created concurrently", self.name),
            Err(e) => return Err(TransxError::Setup(format!("cannot create role {}: {}", self.name, e))),
        }

        self.api
            .attach_policy(&self.name, &self.policy_arn)
            .await
            .map_err(|e| TransxError::Setup(format!("cannot attach {} to {}: {}", self.policy_arn, self.name, e)))?;

        self.recheck().await
    }

    /// IAM is eventually consistent; a created role may not be readable right away.
    async fn recheck(&self) -> Result<String> {
        let mut last_error = None;
        for attempt in 0..self.recheck_attempts {
            match self.api.get_role(&self.name).await {
                Ok(arn) => {
                    info!("Role {} ready: {}", self.name, arn);
                    return Ok(arn);
                }
                Err(e) if matches!(e, RemoteError::NotFound(_)) || e.is_transient() => {
                    warn!("Role {} not visible yet (attempt {}): {}", self.name, attempt + 1, e);
                    last_error = Some(e);
                    tokio::time::sleep(self.recheck_delay).await;
                }
                Err(e) => return Err(TransxError::Setup(format!("cannot read role {}: {}", self.name, e))),
            }
        }
        Err(TransxError::Setup(format!(
            "role {} not visible after {} checks: {}",
            self.name,
            self.recheck_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mockall::mock;

    mock! {
        Roles {}

        #[async_trait]
        impl AccessRoleApi for Roles {
            async fn get_role(&self, name: &str) -> RemoteResult<String>;
            async fn create_role(&self, name: &str, trust_policy: &str) -> RemoteResult<String>;
            async fn attach_policy(&self, name: &str, policy_arn: &str) -> RemoteResult<()>;
        }
    }

    const ARN: &str = "arn:aws:iam::123456789012:role/transx-translate-access";

    fn provisioner(api: MockRoles) -> RoleProvisioner {
        RoleProvisioner::new(Arc::new(api), &Config::default().translate)
    }

    #[test]
    fn test_trust_policy() {
        let policy: serde_json::Value = serde_json::from_str(&trust_policy("translate.amazonaws.com")).unwrap();
        assert_eq!(policy["Statement"][0]["Principal"]["Service"], "translate.amazonaws.com");
        assert_eq!(policy["Statement"][0]["Action"], "sts:AssumeRole");
    }

    #[tokio::test]
    async fn test_existing_role_is_reused() {
        let mut api = MockRoles::new();
        api.expect_get_role().times(1).returning(|_| Ok(ARN.to_string()));
        api.expect_create_role().never();
        api.expect_attach_policy().never();

        let roles = provisioner(api);
        assert_eq!(roles.ensure_role().await.unwrap(), ARN);
        // Cached afterwards
        assert_eq!(roles.ensure_role().await.unwrap(), ARN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_role_created_once_and_rechecked() {
        let mut api = MockRoles::new();
        let mut reads = 0;
        api.expect_get_role().times(3).returning(move |name| {
            reads += 1;
            if reads < 3 {
                Err(RemoteError::NotFound(name.to_string()))
            } else {
                Ok(ARN.to_string())
            }
        });
        api.expect_create_role()
            .withf(|name, policy| name == "transx-translate-access" && policy.contains("translate.amazonaws.com"))
            .times(1)
            .returning(|_, _| Ok(ARN.to_string()));
        api.expect_attach_policy()
            .withf(|_, policy| policy == "arn:aws:iam::aws:policy/AmazonS3FullAccess")
            .times(1)
            .returning(|_, _| Ok(()));

        let roles = provisioner(api);
        let (a, b) = tokio::join!(roles.ensure_role(), roles.ensure_role());
        assert_eq!(a.unwrap(), ARN);
        assert_eq!(b.unwrap(), ARN);
    }

    #[tokio::test]
    async fn test_already_exists_is_success() {
        let mut api = MockRoles::new();
        let mut reads = 0;
        api.expect_get_role().returning(move |name| {
            reads += 1;
            if reads == 1 {
                Err(RemoteError::NotFound(name.to_string()))
            } else {
                Ok(ARN.to_string())
            }
        });
        api.expect_create_role()
            .returning(|name, _| Err(RemoteError::Conflict(name.to_string())));
        api.expect_attach_policy().returning(|_, _| Ok(()));

        assert_eq!(provisioner(api).ensure_role().await.unwrap(), ARN);
    }

    #[tokio::test]
    async fn test_denied_creation_is_setup_error() {
        let mut api = MockRoles::new();
        api.expect_get_role().returning(|name| Err(RemoteError::NotFound(name.to_string())));
        api.expect_create_role()
            .returning(|_, _| Err(RemoteError::Denied("iam:CreateRole".to_string())));

        let result = provisioner(api).ensure_role().await;
        assert!(matches!(result, Err(TransxError::Setup(_))));
    }
}
