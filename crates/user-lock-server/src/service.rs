use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{error, info, instrument, warn};
use user_lock_core::UserFields;

use crate::error::ServiceResultExt;
use crate::manager::UserManager;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("user");
}

use proto::user_service_server::UserService;
use proto::*;

const NOT_FOUND: &str = "User not found";

/// Implementation of the UserService gRPC service.
pub struct UserServiceImpl {
    manager: Arc<UserManager>,
    /// Deadline applied when the caller sends no `grpc-timeout`
    default_timeout: Duration,
}

impl UserServiceImpl {
    pub fn new(manager: Arc<UserManager>, default_timeout: Duration) -> Self {
        Self {
            manager,
            default_timeout,
        }
    }

    fn deadline<T>(&self, request: &Request<T>) -> Instant {
        request_deadline(request.metadata(), self.default_timeout)
    }
}

/// Deadline of a request, from its `grpc-timeout` header or `default`.
pub fn request_deadline(metadata: &MetadataMap, default: Duration) -> Instant {
    let timeout = metadata
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
        .unwrap_or(default);
    Instant::now() + timeout
}

/// Parse a `grpc-timeout` header value: at most 8 digits and a unit.
fn parse_grpc_timeout(raw: &str) -> Option<Duration> {
    if raw.len() < 2 || raw.len() > 9 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(value * 3600)),
        "M" => Some(Duration::from_secs(value * 60)),
        "S" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_millis(value)),
        "u" => Some(Duration::from_micros(value)),
        "n" => Some(Duration::from_nanos(value)),
        _ => None,
    }
}

impl From<user_lock_core::User> for User {
    fn from(user: user_lock_core::User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            age: user.age,
            created_at: user.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            updated_at: user.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[tonic::async_trait]
impl UserService for UserServiceImpl {
    #[instrument(skip(self, request), level = "debug")]
    async fn get_user(
        &self,
        request: Request<GetUserRequest>,
    ) -> Result<Response<GetUserResponse>, Status> {
        let deadline = self.deadline(&request);
        let req = request.into_inner();
        info!(user_id = req.id, "GetUser request received");

        let found = self
            .manager
            .get(req.id, deadline)
            .await
            .inspect_err(|e| error!(user_id = req.id, "GetUser failed: {}", e))
            .map_service_err()?;

        let response = match found {
            Some(user) => {
                info!(user_id = user.id, user_name = %user.name, user_email = %user.email, "User retrieved successfully");
                GetUserResponse {
                    user: Some(user.into()),
                    success: true,
                    message: "User found successfully".to_string(),
                }
            }
            None => {
                warn!(user_id = req.id, "User not found");
                GetUserResponse {
                    user: None,
                    success: false,
                    message: NOT_FOUND.to_string(),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn list_users(
        &self,
        request: Request<ListUsersRequest>,
    ) -> Result<Response<ListUsersResponse>, Status> {
        let deadline = self.deadline(&request);
        let req = request.into_inner();
        info!(page = req.page, limit = req.limit, "ListUsers request received");

        let users = self
            .manager
            .list(deadline)
            .await
            .inspect_err(|e| error!("ListUsers failed: {}", e))
            .map_service_err()?;

        info!(total_users = users.len(), "Users listed successfully");
        Ok(Response::new(ListUsersResponse {
            total: users.len() as i32,
            users: users.into_iter().map(User::from).collect(),
            success: true,
            message: "Users retrieved successfully".to_string(),
        }))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn create_user(
        &self,
        request: Request<CreateUserRequest>,
    ) -> Result<Response<CreateUserResponse>, Status> {
        let deadline = self.deadline(&request);
        let req = request.into_inner();
        info!(user_name = %req.name, user_email = %req.email, user_age = req.age, "CreateUser request received");

        let fields = UserFields {
            name: req.name,
            email: req.email,
            age: req.age,
        };
        let user = self
            .manager
            .create(fields, deadline)
            .await
            .inspect_err(|e| error!("CreateUser failed: {}", e))
            .map_service_err()?;

        info!(user_id = user.id, user_name = %user.name, user_email = %user.email, "User created successfully");
        Ok(Response::new(CreateUserResponse {
            user: Some(user.into()),
            success: true,
            message: "User created successfully".to_string(),
        }))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn update_user(
        &self,
        request: Request<UpdateUserRequest>,
    ) -> Result<Response<UpdateUserResponse>, Status> {
        let deadline = self.deadline(&request);
        let req = request.into_inner();
        info!(user_id = req.id, user_name = %req.name, user_email = %req.email, user_age = req.age, "UpdateUser request received");

        let id = req.id;
        let fields = UserFields {
            name: req.name,
            email: req.email,
            age: req.age,
        };
        let updated = self
            .manager
            .update(id, fields, deadline)
            .await
            .inspect_err(|e| error!(user_id = id, "UpdateUser failed: {}", e))
            .map_service_err()?;

        let response = match updated {
            Some(user) => {
                info!(user_id = user.id, user_name = %user.name, user_email = %user.email, "User updated successfully");
                UpdateUserResponse {
                    user: Some(user.into()),
                    success: true,
                    message: "User updated successfully".to_string(),
                }
            }
            None => {
                warn!(user_id = id, "User not found for update");
                UpdateUserResponse {
                    user: None,
                    success: false,
                    message: NOT_FOUND.to_string(),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn delete_user(
        &self,
        request: Request<DeleteUserRequest>,
    ) -> Result<Response<DeleteUserResponse>, Status> {
        let deadline = self.deadline(&request);
        let req = request.into_inner();
        info!(user_id = req.id, "DeleteUser request received");

        let deleted = self
            .manager
            .delete(req.id, deadline)
            .await
            .inspect_err(|e| error!(user_id = req.id, "DeleteUser failed: {}", e))
            .map_service_err()?;

        let response = if deleted {
            info!(user_id = req.id, "User deleted successfully");
            DeleteUserResponse {
                success: true,
                message: "User deleted successfully".to_string(),
            }
        } else {
            warn!(user_id = req.id, "User not found for deletion");
            DeleteUserResponse {
                success: false,
                message: NOT_FOUND.to_string(),
            }
        };
        Ok(Response::new(response))
    }
}
