//! DNS provider client against a local stand-in for the Cloudflare API

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use routegate::dns::CloudflareClient;
use routegate::error::DnsError;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const TOKEN: &str = "test-token";

#[derive(Default)]
struct FakeDns {
    records: Vec<(String, String, String)>,
    next_id: u32,
}

type Shared = Arc<Mutex<FakeDns>>;

fn reply(status: u16, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn query_params(req: &Request<Incoming>) -> HashMap<String, String> {
    req.uri()
        .query()
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.replace('+', " ")))
        .collect()
}

async fn handle(state: Shared, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some(format!("Bearer {}", TOKEN).as_str());
    if !authorized {
        return Ok(reply(
            403,
            json!({"success": false, "errors": [{"code": 9109, "message": "Invalid access token"}], "result": null}),
        ));
    }

    let path = req.uri().path().to_string();
    let params = query_params(&req);
    let method = req.method().clone();

    let response = match (method, path.as_str()) {
        (Method::GET, "/zones") => reply(
            200,
            json!({
                "success": true,
                "errors": [],
                "result": [
                    {"id": "z-parked", "name": "aaa-parked.org", "name_servers": []},
                    {"id": "z-main", "name": "example.com", "name_servers": ["ns1.example.net"]},
                ],
                "result_info": {"page": 1, "total_pages": 1},
            }),
        ),
        (Method::POST, "/zones/z-main/dns_records") => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let record: Value = serde_json::from_slice(&body).unwrap();
            let mut dns = state.lock().unwrap();
            dns.next_id += 1;
            let id = format!("r{}", dns.next_id);
            dns.records.push((
                id.clone(),
                record["name"].as_str().unwrap().to_string(),
                record["content"].as_str().unwrap().to_string(),
            ));
            reply(200, json!({"success": true, "errors": [], "result": {"id": id}}))
        }
        (Method::GET, "/zones/z-main/dns_records") => {
            let dns = state.lock().unwrap();
            let matching: Vec<Value> = dns
                .records
                .iter()
                .filter(|(_, name, _)| Some(name) == params.get("name"))
                .filter(|(_, _, content)| params.get("content").map_or(true, |c| c == content))
                .map(|(id, _, _)| json!({"id": id}))
                .collect();
            reply(200, json!({"success": true, "errors": [], "result": matching}))
        }
        (Method::DELETE, p) if p.starts_with("/zones/z-main/dns_records/") => {
            let id = p.rsplit('/').next().unwrap_or_default().to_string();
            state.lock().unwrap().records.retain(|(rid, _, _)| *rid != id);
            reply(200, json!({"success": true, "errors": [], "result": {"id": id}}))
        }
        _ => reply(404, json!({"success": false, "errors": [{"code": 7003, "message": "No route"}]})),
    };
    Ok(response)
}

async fn start_fake_api() -> (String, Shared) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state: Shared = Arc::default();
    let server_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let state = server_state.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(state.clone(), req));
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (format!("http://{}", addr), state)
}

#[tokio::test]
async fn test_create_and_delete_txt_records() {
    let (base_url, state) = start_fake_api().await;
    let client = CloudflareClient::new(TOKEN).unwrap().with_base_url(base_url);

    client.create_txt("_acme-challenge.www.example.com", "first").await.unwrap();
    client.create_txt("_acme-challenge.www.example.com", "second").await.unwrap();
    assert_eq!(state.lock().unwrap().records.len(), 2);

    let deleted = client.delete_txt("_acme-challenge.www.example.com", "first").await.unwrap();
    assert_eq!(deleted, 1);
    let remaining = state.lock().unwrap().records.clone();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].2, "second");

    assert_eq!(client.delete_txt("_acme-challenge.www.example.com", "first").await.unwrap(), 0);
    assert_eq!(client.delete_txt_all("_acme-challenge.www.example.com").await.unwrap(), 1);
    assert!(state.lock().unwrap().records.is_empty());
}

#[tokio::test]
async fn test_record_outside_any_zone() {
    let (base_url, _state) = start_fake_api().await;
    let client = CloudflareClient::new(TOKEN).unwrap().with_base_url(base_url);

    let result = client.create_txt("_acme-challenge.other.net", "v").await;
    assert!(matches!(result, Err(DnsError::NoZone(_))));
}

#[tokio::test]
async fn test_access_check_uses_first_zone_with_name_servers() {
    let (base_url, state) = start_fake_api().await;
    let client = CloudflareClient::new(TOKEN).unwrap().with_base_url(base_url);

    assert_eq!(client.test_access().await.unwrap(), "example.com");
    assert!(state.lock().unwrap().records.is_empty());
}

#[tokio::test]
async fn test_rejected_token_reports_api_error() {
    let (base_url, _state) = start_fake_api().await;
    let client = CloudflareClient::new("wrong").unwrap().with_base_url(base_url);

    match client.zones().await {
        Err(DnsError::Api(message)) => {
            assert!(message.contains("403"), "{}", message);
            assert!(message.contains("Invalid access token"), "{}", message);
        }
        other => panic!("expected API error, got {:?}", other.map(|z| z.len())),
    }
}
