pub use self::body::{BodyConsumer, BodyPart, BodyStream, Delivery, DeliveryError, Demand};
pub use self::http::{Client, ClientBuilder};
pub use self::request::{Request, RequestBuilder};
pub use self::response::{Response, ResponseHead};

pub mod body;
mod exec;
mod http;
mod request;
mod response;
