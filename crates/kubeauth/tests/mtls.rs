//! Client certificates against a TLS server that requires them.

mod support;

use std::sync::Arc;

use async_trait::async_trait;
use kubeauth::{
    Client, Configuration, CredentialProvider, DataSource, Error, ExecConfig, ExecInvocation,
    ExecInvoker, ExecPluginError, ExecPluginRunner, ExecProvider, RequestAuthenticator, Transport,
    TransportBuilder,
};
use reqwest::StatusCode;
use support::{
    CA, CHAINED_CLIENT, CHAINED_CLIENT_KEY, CLIENT, CLIENT_KEY, ROGUE_CLIENT, ROGUE_CLIENT_KEY,
    TestServer,
};

fn client(server: &TestServer, identity: Option<(&[u8], &[u8])>) -> Client {
    let mut builder =
        Configuration::builder(server.url()).certificate_authority(DataSource::Inline(CA.to_vec()));
    if let Some((certificate, key)) = identity {
        builder = builder.client_certificate(
            DataSource::Inline(certificate.to_vec()),
            DataSource::Inline(key.to_vec()),
        );
    }
    Client::new(builder.build().expect("config")).expect("client")
}

#[tokio::test]
async fn trusted_client_certificate_is_accepted() {
    let server = TestServer::start().await;
    let client = client(&server, Some((CLIENT, CLIENT_KEY)));

    let response = client.get("/version").await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "ok");
    assert_eq!(server.verified(), 1);
}

#[tokio::test]
async fn intermediate_certificates_are_presented() {
    let server = TestServer::start().await;
    let client = client(&server, Some((CHAINED_CLIENT, CHAINED_CLIENT_KEY)));

    let response = client.get("/version").await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.verified(), 1);
}

#[tokio::test]
async fn untrusted_client_certificate_is_rejected() {
    let server = TestServer::start().await;
    let client = client(&server, Some((ROGUE_CLIENT, ROGUE_CLIENT_KEY)));

    let err = client.get("/version").await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert!(server.verified() >= 1);
}

#[tokio::test]
async fn missing_client_certificate_is_rejected() {
    let server = TestServer::start().await;
    let client = client(&server, None);

    let err = client.get("/version").await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert_eq!(server.verified(), 0);
}

#[tokio::test]
async fn server_outside_the_configured_authority_is_rejected() {
    let server = TestServer::start().await;
    let config = Configuration::builder(server.url())
        .certificate_authority(DataSource::Inline(
            include_bytes!("fixtures/rogue-ca.pem").to_vec(),
        ))
        .client_certificate(
            DataSource::Inline(CLIENT.to_vec()),
            DataSource::Inline(CLIENT_KEY.to_vec()),
        )
        .build()
        .expect("config");
    let client = Client::new(config).expect("client");

    let err = client.get("/version").await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert_eq!(server.verified(), 0);
}

struct CertificatePlugin;

#[async_trait]
impl ExecInvoker for CertificatePlugin {
    async fn invoke(&self, _: &ExecInvocation) -> Result<Vec<u8>, ExecPluginError> {
        Ok(serde_json::json!({
            "apiVersion": "client.authentication.k8s.io/v1",
            "kind": "ExecCredential",
            "status": {
                "clientCertificateData": String::from_utf8_lossy(CLIENT),
                "clientKeyData": String::from_utf8_lossy(CLIENT_KEY),
            },
        })
        .to_string()
        .into_bytes())
    }
}

#[tokio::test]
async fn exec_plugin_certificate_is_presented() {
    let server = TestServer::start().await;
    let provider = CredentialProvider::Exec(ExecProvider::new(
        ExecConfig {
            api_version: "client.authentication.k8s.io/v1".into(),
            command: "cert-helper".into(),
            args: Vec::new(),
            env: Vec::new(),
            install_hint: None,
        },
        ExecPluginRunner::new(Arc::new(CertificatePlugin)),
    ));
    let authority = reqwest::Certificate::from_pem(CA).expect("authority");
    let transport =
        Transport::new(TransportBuilder::new().add_authority(authority)).expect("transport");
    let authenticator = RequestAuthenticator::new(provider, transport);

    for _ in 0..2 {
        let request = reqwest::Request::new(
            reqwest::Method::GET,
            format!("{}/version", server.url()).parse().expect("url"),
        );
        let response = authenticator.execute(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert!(server.verified() >= 1);
}
