use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use report_pipeline::domain::{QueryId, Scalar};
use report_pipeline::error::{ErrorKind, ReportError};
use report_pipeline::redash::{QueryClient, RedashHttpClient, parse_query_result};
use report_pipeline::transform::transform;

const FIXTURE: &str = include_str!("fixtures/query_result.json");

/// Serves a single canned HTTP response and hands back the request line.
fn serve_once(status: &str, body: &str) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}/api", listener.local_addr().unwrap());
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut request_line = String::new();
        reader.read_line(&mut request_line).unwrap();
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).unwrap();
            if header == "\r\n" || header.is_empty() {
                break;
            }
        }
        stream.write_all(response.as_bytes()).unwrap();
        stream.flush().unwrap();
        sender.send(request_line).unwrap();
    });
    (base_url, receiver)
}

fn params() -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("api_key".to_string(), "secret".to_string());
    params.insert("p_Latest Monthly Data".to_string(), "2023-08-01".to_string());
    params
}

#[test]
fn fixture_parses_into_declared_columns() {
    let body = serde_json::from_str(FIXTURE).unwrap();
    let raw = parse_query_result(&body).unwrap();

    assert_eq!(raw.columns, vec!["month", "service", "signups"]);
    assert_eq!(raw.rows.len(), 4);
    assert_eq!(raw.value(2, "signups"), &Scalar::Number(1201877.0));
    assert_eq!(raw.value(3, "signups"), &Scalar::Null);
}

#[test]
fn fixture_pivots_by_month_and_service() {
    let body = serde_json::from_str(FIXTURE).unwrap();
    let table = transform(parse_query_result(&body).unwrap(), true, true).unwrap();

    assert_eq!(table.headers, vec!["month", "Max", "Netflix", "Peacock"]);
    assert_eq!(table.len(), 2);
    assert_eq!(
        table.rows[1],
        vec![
            Scalar::from("2023-08"),
            Scalar::Null,
            Scalar::Number(1201877.0),
            Scalar::Null
        ]
    );
}

#[test]
fn client_requests_results_with_parameters() {
    let (base_url, request) = serve_once("200 OK", FIXTURE);
    let client = RedashHttpClient::new(&base_url, Duration::from_secs(5)).unwrap();
    let query_id: QueryId = "20491".parse().unwrap();

    let raw = client.fetch(&query_id, &params()).unwrap();
    assert_eq!(raw.rows.len(), 4);

    let request_line = request.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(request_line.starts_with("GET /api/queries/20491/results.json?"));
    assert!(request_line.contains("api_key=secret"));
    assert!(request_line.contains("p_Latest+Monthly+Data=2023-08-01"));
}

#[test]
fn non_success_status_is_a_fetch_error() {
    let (base_url, _request) = serve_once("500 Internal Server Error", r#"{"message":"boom"}"#);
    let client = RedashHttpClient::new(&base_url, Duration::from_secs(5)).unwrap();
    let query_id = QueryId::from(20492);

    let err = client.fetch(&query_id, &params()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FetchError);
    assert_matches!(err, ReportError::QueryStatus { status: 500, ref message } if message.contains("boom"));
}

#[test]
fn malformed_body_is_a_decode_error() {
    let (base_url, _request) = serve_once("200 OK", "not json");
    let client = RedashHttpClient::new(&base_url, Duration::from_secs(5)).unwrap();

    let err = client.fetch(&QueryId::from(20494), &params()).unwrap_err();
    assert_matches!(err, ReportError::QueryDecode(_));
}

#[test]
fn unreachable_service_is_a_fetch_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}/api", listener.local_addr().unwrap());
    drop(listener);
    let client = RedashHttpClient::new(&base_url, Duration::from_secs(2)).unwrap();

    let err = client.fetch(&QueryId::from(20493), &params()).unwrap_err();
    assert_matches!(err, ReportError::QueryHttp(_));
    assert_eq!(err.kind(), ErrorKind::FetchError);
}

#[test]
fn results_url_trims_trailing_slash() {
    let client = RedashHttpClient::new("https://redash.example.com/api/", Duration::from_secs(1)).unwrap();
    assert_eq!(
        client.results_url(&QueryId::from(20491)),
        "https://redash.example.com/api/queries/20491/results.json"
    );
}
