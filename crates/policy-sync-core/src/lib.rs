pub mod batch;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod force_update;
pub mod hash;
pub mod http;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod roles;

pub use batch::{BatchClient, BatchMethod, BatchRequest, BatchResponse};
pub use config::{ApiVersions, BatchSettings, InvocationContext, RetrySettings, SyncConfig, SyncMode};
pub use credentials::{AccessToken, AzureCliCredential, CredentialProvider, StaticCredential};
pub use error::{Result, SyncError};
pub use http::{HttpRequest, HttpResponse, HttpTransport, RestClient};
pub use model::{
    LocalPolicy, Operation, PolicyKind, PolicyObject, PolicyRequest, PolicyResult, PolicyStatus,
    ResultType, RoleRequest, UpsertOutcome,
};
pub use pipeline::{RunReport, preview, run};
