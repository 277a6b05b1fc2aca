// Client creation with custom user-agent support for kube 2.x
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};

/// Create a new k8s client to interact with the cluster api
///
/// Falls back to [`super::USER_AGENT`] when no user agent is given; an
/// unparsable value falls through to kube's default header.
///
/// # Errors
///
/// Will return `Err` if cluster configuration cannot be inferred
pub async fn new(custom_user_agent: Option<&str>) -> Result<Client> {
    let mut config = Config::infer().await?;

    let user_agent = custom_user_agent.unwrap_or(super::USER_AGENT);
    if let Ok(header_value) = HeaderValue::from_str(user_agent) {
        config
            .headers
            .push((HeaderName::from_static("user-agent"), header_value));
    }

    let client = Client::try_from(config)?;

    Ok(client)
}
