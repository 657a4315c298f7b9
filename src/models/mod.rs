mod api;

pub use api::{
    ActuatorIndex, AppInfo, BackendResponse, DelayQuery, FALLBACK_MESSAGE, FallbackResponse,
    HeadersResponse, HealthResponse, InfoResponse, Link,
};
