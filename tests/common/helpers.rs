use std::collections::HashMap;
use std::sync::Arc;

use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Empty};
use proxxy::{Config, OriginClient, ProxyService, S3ClientPool, StreamingBody, UrlSigner};

use super::MockStore;

pub const TEST_HOST: &str = "ftp.mozilla.org";

/// Config with one backend pointing at `origin_url` plus any overrides.
pub fn test_config(origin_url: &str, extra: &[(&str, &str)]) -> Config {
    let mut env = HashMap::new();
    env.insert("AWS_ACCESS_KEY".to_string(), "AKIDEXAMPLE".to_string());
    env.insert("AWS_SECRET_KEY".to_string(), "secret".to_string());
    env.insert("BACKENDS".to_string(), format!("{TEST_HOST}={origin_url}"));
    for (name, value) in extra {
        env.insert(name.to_string(), value.to_string());
    }
    Config::from_env(&env)
}

fn sdk_config() -> SdkConfig {
    SdkConfig::builder()
        .behavior_version(BehaviorVersion::latest())
        .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
            "AKIDEXAMPLE",
            "secret",
            None,
            None,
            "test",
        )))
        .build()
}

/// Proxy over the mock store. Signing uses real SigV4 with static test
/// credentials and never leaves the process.
pub fn create_test_proxy(config: &Config, store: &MockStore) -> Arc<ProxyService<MockStore>> {
    let pool = Arc::new(S3ClientPool::new(&sdk_config(), config));
    let signer = UrlSigner::new(pool, config.signed_url_ttl);
    let origin = OriginClient::new(config).unwrap();
    Arc::new(ProxyService::new(
        config,
        Arc::new(store.clone()),
        signer,
        origin,
    ))
}

/// Build a request with a Host header
pub fn build_request(method: Method, host: &str, path: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", host)
        .body(Empty::new())
        .unwrap()
}

pub fn build_get_request(host: &str, path: &str) -> Request<Empty<Bytes>> {
    build_request(Method::GET, host, path)
}

pub async fn body_string(response: Response<StreamingBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn location(response: &Response<StreamingBody>) -> String {
    response
        .headers()
        .get("location")
        .expect("redirect without location")
        .to_str()
        .unwrap()
        .to_string()
}

/// Value of a query parameter in a signed URL.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
