pub mod endpoint;
pub mod error;
pub mod json;
pub mod request;

pub use routerify::ext::RequestExt;
pub use routerify::RouterBuilder;
pub use routerify::RouterService;

pub use error::ApiError;
