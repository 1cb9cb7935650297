use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::{debug, info};

pub mod proto {
    tonic::include_proto!("user");
}

use proto::user_service_client::UserServiceClient;
use proto::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid server address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("failed to {op}: {} ({:?})", .status.message(), .status.code())]
    Rpc {
        op: &'static str,
        #[source]
        status: tonic::Status,
    },

    #[error("failed to {op}: {message}")]
    Rejected { op: &'static str, message: String },

    #[error("server returned no user despite success")]
    MissingUser,
}

/// Thin wrapper over the generated client.
///
/// Every call carries the configured deadline and turns `success = false`
/// responses into [`ClientError::Rejected`].
#[derive(Clone)]
pub struct UserClient {
    inner: UserServiceClient<Channel>,
    timeout: Duration,
}

impl UserClient {
    /// Connect to `addr` (`host:port` or a full `http://` URI).
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, ClientError> {
        let uri = server_uri(addr);
        info!("Connecting to gRPC server at {}", uri);

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| ClientError::InvalidAddress {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|source| ClientError::Connect { addr: uri, source })?;

        Ok(Self {
            inner: UserServiceClient::new(channel),
            timeout,
        })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.timeout);
        request
    }

    pub async fn create_user(&mut self, name: &str, email: &str, age: i32) -> Result<User, ClientError> {
        let request = self.request(CreateUserRequest {
            name: name.to_string(),
            email: email.to_string(),
            age,
        });
        let resp = self
            .inner
            .create_user(request)
            .await
            .map_err(|status| ClientError::Rpc { op: "create user", status })?
            .into_inner();

        let user = accepted("create user", resp.success, resp.message, resp.user)?;
        info!(id = user.id, name = %user.name, email = %user.email, "User created");
        Ok(user)
    }

    pub async fn get_user(&mut self, id: i32) -> Result<User, ClientError> {
        let request = self.request(GetUserRequest { id });
        let resp = self
            .inner
            .get_user(request)
            .await
            .map_err(|status| ClientError::Rpc { op: "get user", status })?
            .into_inner();

        let user = accepted("get user", resp.success, resp.message, resp.user)?;
        info!(id = user.id, name = %user.name, email = %user.email, "User retrieved");
        Ok(user)
    }

    pub async fn list_users(&mut self) -> Result<Vec<User>, ClientError> {
        let request = self.request(ListUsersRequest { page: 1, limit: 100 });
        let resp = self
            .inner
            .list_users(request)
            .await
            .map_err(|status| ClientError::Rpc { op: "list users", status })?
            .into_inner();

        if !resp.success {
            return Err(ClientError::Rejected {
                op: "list users",
                message: resp.message,
            });
        }
        debug!(total = resp.total, "Users listed");
        Ok(resp.users)
    }

    pub async fn update_user(
        &mut self,
        id: i32,
        name: &str,
        email: &str,
        age: i32,
    ) -> Result<User, ClientError> {
        let request = self.request(UpdateUserRequest {
            id,
            name: name.to_string(),
            email: email.to_string(),
            age,
        });
        let resp = self
            .inner
            .update_user(request)
            .await
            .map_err(|status| ClientError::Rpc { op: "update user", status })?
            .into_inner();

        let user = accepted("update user", resp.success, resp.message, resp.user)?;
        info!(id = user.id, name = %user.name, email = %user.email, "User updated");
        Ok(user)
    }

    pub async fn delete_user(&mut self, id: i32) -> Result<(), ClientError> {
        let request = self.request(DeleteUserRequest { id });
        let resp = self
            .inner
            .delete_user(request)
            .await
            .map_err(|status| ClientError::Rpc { op: "delete user", status })?
            .into_inner();

        if !resp.success {
            return Err(ClientError::Rejected {
                op: "delete user",
                message: resp.message,
            });
        }
        info!(id, "User deleted");
        Ok(())
    }
}

fn accepted(
    op: &'static str,
    success: bool,
    message: String,
    user: Option<User>,
) -> Result<User, ClientError> {
    if !success {
        return Err(ClientError::Rejected { op, message });
    }
    user.ok_or(ClientError::MissingUser)
}

/// Add the `http://` scheme to bare `host:port` addresses.
fn server_uri(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}
