//! Fleet client wire behaviour against a local one-shot HTTP server.

use std::time::Duration;

use fleet_cpi::fleet::types::DeleteOptions;
use fleet_cpi::{FleetApi, FleetClient, FleetCredentials, FleetError, VmId};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const HEADER_END: &[u8] = b"\r\n\r\n";

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .unwrap_or_else(|err| panic!("read request: {err}"));
        buffer.extend(chunk.iter().take(read));
        if read == 0 || request_complete(&buffer) {
            break;
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

fn request_complete(buffer: &[u8]) -> bool {
    let Some(header_len) = buffer
        .windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
    else {
        return false;
    };
    let headers = String::from_utf8_lossy(buffer.get(..header_len).unwrap_or_default());
    let body_len = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    buffer.len() >= header_len + HEADER_END.len() + body_len
}

async fn serve_once(status: u16, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind listener: {err}"));
    let address = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener
            .accept()
            .await
            .unwrap_or_else(|err| panic!("accept: {err}"));
        let request = read_request(&mut stream).await;
        let response = format!(
            "HTTP/1.1 {status} STATUS\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(response.as_bytes())
            .await
            .unwrap_or_else(|err| panic!("write response: {err}"));
        request
    });
    (format!("http://{address}"), handle)
}

fn client(base_url: &str, account_id: Option<&str>, timeout: Duration) -> FleetClient {
    FleetClient::new(
        base_url,
        FleetCredentials {
            token: String::from("secret-token"),
            account_id: account_id.map(str::to_owned),
        },
        timeout,
    )
    .unwrap_or_else(|err| panic!("build client: {err}"))
}

#[tokio::test]
async fn requests_carry_bearer_token_and_account_scope() {
    let (base_url, server) = serve_once(
        200,
        r#"{"response":{"items":[{"id":"sig-1","name":"bosh/abcd1234"}],"errors":[]}}"#,
    )
    .await;

    let record = client(&base_url, Some("act-1"), Duration::from_secs(5))
        .read_group(&VmId::from("sig-1"))
        .await
        .unwrap_or_else(|err| panic!("read group: {err}"))
        .unwrap_or_else(|| panic!("group should be returned"));
    let request = server
        .await
        .unwrap_or_else(|err| panic!("server task: {err}"))
        .to_lowercase();

    assert_eq!(record.id, "sig-1");
    assert!(
        request.starts_with("get /group/sig-1?accountid=act-1 "),
        "unexpected request line: {request}"
    );
    assert!(
        request.contains("authorization: bearer secret-token"),
        "missing bearer header: {request}"
    );
}

#[tokio::test]
async fn account_parameter_is_omitted_without_scope() {
    let (base_url, server) =
        serve_once(200, r#"{"response":{"items":[],"errors":[]}}"#).await;

    let members = client(&base_url, None, Duration::from_secs(5))
        .group_status(&VmId::from("sig-1"))
        .await
        .unwrap_or_else(|err| panic!("group status: {err}"));
    let request = server
        .await
        .unwrap_or_else(|err| panic!("server task: {err}"));

    assert!(members.is_empty());
    assert!(
        request.starts_with("GET /group/sig-1/status HTTP/1.1"),
        "unexpected request line: {request}"
    );
}

#[rstest]
#[case(400, "GROUP_DOESNT_EXIST")]
#[case(404, "RESOURCE_DOESNT_EXIST")]
#[tokio::test]
async fn deleting_an_absent_group_reports_not_found(#[case] status: u16, #[case] code: &str) {
    let body: &'static str = match code {
        "GROUP_DOESNT_EXIST" => {
            r#"{"response":{"errors":[{"code":"GROUP_DOESNT_EXIST","message":"gone"}]}}"#
        }
        _ => r#"{"response":{"errors":[{"code":"RESOURCE_DOESNT_EXIST","message":"gone"}]}}"#,
    };
    let (base_url, server) = serve_once(status, body).await;

    let found = client(&base_url, None, Duration::from_secs(5))
        .delete_group(&VmId::from("sig-1"), &DeleteOptions::reclaim_all())
        .await
        .unwrap_or_else(|err| panic!("delete group: {err}"));
    let request = server
        .await
        .unwrap_or_else(|err| panic!("server task: {err}"));

    assert!(!found);
    assert!(request.starts_with("DELETE /group/sig-1 "), "{request}");
    assert!(request.contains("shouldDeleteVolumes"), "{request}");
}

#[tokio::test]
async fn server_errors_surface_with_status_and_code() {
    let (base_url, _server) = serve_once(
        500,
        r#"{"response":{"errors":[{"code":"INTERNAL","message":"boom"}]}}"#,
    )
    .await;

    let err = client(&base_url, None, Duration::from_secs(5))
        .delete_group(&VmId::from("sig-1"), &DeleteOptions::reclaim_all())
        .await
        .expect_err("server error");

    assert_eq!(
        err,
        FleetError::Api {
            operation: String::from("DELETE /group/sig-1"),
            status: 500,
            code: String::from("INTERNAL"),
            message: String::from("boom"),
        }
    );
}

#[tokio::test]
async fn slow_responses_are_transport_timeouts() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind listener: {err}"));
    let address = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let _server = tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap_or_else(|err| panic!("accept: {err}"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let err = client(
        &format!("http://{address}"),
        None,
        Duration::from_millis(200),
    )
    .group_status(&VmId::from("sig-1"))
    .await
    .expect_err("request should time out");

    assert_eq!(
        err,
        FleetError::Timeout {
            operation: String::from("GET /group/sig-1/status"),
        }
    );
}
