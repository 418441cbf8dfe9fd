use crate::config::Config;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Recommendation service timed out.")]
    Timeout,
    #[error("Recommendation service is unreachable: {0}")]
    Network(String),
    #[error("Recommendation service returned status {0}.")]
    Status(u16),
    #[error("Recommendation service response could not be parsed.")]
    MalformedResponse,
    #[error("Recommendation client could not be initialized: {0}")]
    ClientInit(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoPoint {
    pub step: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoRunSeries {
    pub run_id: String,
    pub val_acc: Vec<RecoPoint>,
    pub train_loss: Vec<RecoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoRequest {
    pub experiment_id: String,
    pub runs: Vec<RecoRunSeries>,
}

/// One suggestion from the service. `type` is an open tag: unknown values
/// are carried through untouched so newer service versions keep working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoSuggestion {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub predicted_score: Option<f64>,
    #[serde(default)]
    pub explanations: Option<Map<String, Value>>,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoResponse {
    #[serde(default)]
    pub suggestions: Vec<RecoSuggestion>,
}

/// Seam for the external recommendation service; tests substitute mocks.
pub trait RecoClient: Send + Sync {
    fn analyze(&self, request: &RecoRequest) -> Result<RecoResponse, UpstreamError>;
}

/// Blocking JSON-over-HTTP client with a bounded round-trip timeout.
pub struct HttpRecoClient {
    endpoint: Url,
    http: Client,
}

impl HttpRecoClient {
    pub fn new(config: &Config) -> Result<Self, UpstreamError> {
        let http = Client::builder()
            .timeout(config.reco_timeout)
            .build()
            .map_err(|e| UpstreamError::ClientInit(e.to_string()))?;
        Ok(Self {
            endpoint: config.reco_url.clone(),
            http,
        })
    }
}

impl RecoClient for HttpRecoClient {
    fn analyze(&self, request: &RecoRequest) -> Result<RecoResponse, UpstreamError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        response
            .json::<RecoResponse>()
            .map_err(|_| UpstreamError::MalformedResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpRecoClient, RecoClient, RecoRequest, UpstreamError};
    use crate::config::Config;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn spawn_http_server(status_line: &str, body: String) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let url = format!("http://{addr}/reco");
        let status_line = status_line.to_string();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0_u8; 4096];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).expect("write response");
        });

        (url, handle)
    }

    fn client_for(url: &str) -> HttpRecoClient {
        let config = Config::default().with_reco_url(url).expect("url");
        HttpRecoClient::new(&config).expect("client")
    }

    fn empty_request() -> RecoRequest {
        RecoRequest {
            experiment_id: "exp_1".to_string(),
            runs: Vec::new(),
        }
    }

    #[test]
    fn decodes_suggestions_from_a_success_response() {
        let body = r#"{"suggestions":[
            {"type":"EARLY_STOP_HINT","params":{"runId":"run_1"},"predictedScore":0.8},
            {"type":"SOMETHING_NEW","params":{}}
        ]}"#;
        let (url, handle) = spawn_http_server("200 OK", body.to_string());

        let response = client_for(&url).analyze(&empty_request()).expect("analyze");
        handle.join().expect("server thread");

        assert_eq!(response.suggestions.len(), 2);
        assert_eq!(response.suggestions[0].kind, "EARLY_STOP_HINT");
        assert_eq!(response.suggestions[0].predicted_score, Some(0.8));
        assert_eq!(
            response.suggestions[0].params.get("runId").and_then(|v| v.as_str()),
            Some("run_1")
        );
        assert_eq!(response.suggestions[1].kind, "SOMETHING_NEW");
    }

    #[test]
    fn non_success_status_is_surfaced() {
        let (url, handle) = spawn_http_server("500 Internal Server Error", "{}".to_string());
        let result = client_for(&url).analyze(&empty_request());
        handle.join().expect("server thread");
        assert!(matches!(result, Err(UpstreamError::Status(500))));
    }

    #[test]
    fn undecodable_body_is_malformed() {
        let (url, handle) = spawn_http_server("200 OK", "not json at all".to_string());
        let result = client_for(&url).analyze(&empty_request());
        handle.join().expect("server thread");
        assert!(matches!(result, Err(UpstreamError::MalformedResponse)));
    }

    #[test]
    fn unreachable_endpoint_is_a_network_error() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let result = client_for(&format!("http://127.0.0.1:{port}/reco"))
            .analyze(&empty_request());
        assert!(matches!(result, Err(UpstreamError::Network(_))));
    }

    #[test]
    fn request_serializes_with_camel_case_wire_names() {
        let request = RecoRequest {
            experiment_id: "exp_9".to_string(),
            runs: vec![super::RecoRunSeries {
                run_id: "run_9".to_string(),
                val_acc: vec![super::RecoPoint { step: 1, value: 0.5 }],
                train_loss: Vec::new(),
            }],
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["experimentId"], "exp_9");
        assert_eq!(json["runs"][0]["runId"], "run_9");
        assert_eq!(json["runs"][0]["valAcc"][0]["step"], 1);
        assert!(json["runs"][0]["trainLoss"].as_array().expect("array").is_empty());
    }
}
