//! Local SSH agent integration.
//!
//! When `SSH_AUTH_SOCK` points at a reachable agent, its identities are tried
//! opportunistically after the statically configured signers. Signing is
//! delegated to the agent; private keys never enter this process.

use russh::client::{Handle, Handler};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info};

use super::error::SshError;

/// Send-safe [`Signer`] over a borrowed agent connection.
///
/// russh's built-in `impl Signer for AgentClient` borrows the sign-request key
/// across an await point, which the compiler cannot prove `Send` through
/// RPITIT. Cloning the key into the future sidesteps that; the clone is a few
/// dozen bytes.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl std::future::Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connection to the system SSH agent.
pub struct SshAgentClient {
    agent: AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl SshAgentClient {
    /// Connects to the agent named by `SSH_AUTH_SOCK`.
    pub async fn connect() -> Result<Self, SshError> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env()
                .await
                .map_err(|e| SshError::AgentNotAvailable(e.to_string()))?;
            debug!("connected to SSH agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(unix))]
        {
            Err(SshError::AgentNotAvailable(
                "SSH agent is only supported on unix platforms".to_string(),
            ))
        }
    }

    /// Tries every agent-held identity against the server.
    ///
    /// Returns `Ok(true)` on the first accepted key, `Ok(false)` when the
    /// agent has no keys or none were accepted.
    pub async fn authenticate<H: Handler>(
        &mut self,
        handle: &mut Handle<H>,
        user: &str,
    ) -> Result<bool, SshError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| SshError::Agent(format!("failed to list agent keys: {e}")))?;

        if keys.is_empty() {
            debug!("SSH agent holds no keys");
            return Ok(false);
        }

        info!("SSH agent reports {} key(s)", keys.len());

        for key in &keys {
            debug!("trying agent key {} ({})", key.algorithm(), key.comment());
            match handle
                .authenticate_publickey_with(
                    user,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!("agent authentication succeeded with key {}", key.comment());
                    return Ok(true);
                }
                Ok(_) => debug!("agent key rejected by server: {}", key.comment()),
                Err(e) => debug!("agent signing error for key {}: {}", key.comment(), e),
            }
        }

        Ok(false)
    }
}

/// Whether an agent socket appears to be configured.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var("SSH_AUTH_SOCK").is_ok()
    }

    #[cfg(not(unix))]
    {
        false
    }
}
