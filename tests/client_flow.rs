//! Two-stage client flow against a scripted proxy: stage one parses the
//! vision body, stage two only fires after stage one succeeded.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

use calorie_camera::{CancelToken, CapturedFrame, InferenceClient};

/// Scripted proxy: answers `/analyze` and `/explain` with canned bodies,
/// reporting each path hit on the channel.
fn scripted_proxy(analyze_body: &str, explain_body: &str) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let analyze_body = analyze_body.to_string();
    let explain_body = explain_body.to_string();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for _ in 0..2 {
            let (mut stream, _) = match listener.accept() {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let header_end = loop {
                let n = stream.read(&mut buf).unwrap();
                raw.extend_from_slice(&buf[..n]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos;
                }
            };
            let headers = String::from_utf8_lossy(&raw[..header_end]).into_owned();
            let path = headers
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or_default()
                .to_string();
            let content_length: usize = headers
                .lines()
                .find_map(|line| {
                    line.to_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse().unwrap())
                })
                .unwrap_or(0);
            let mut body = raw[header_end + 4..].to_vec();
            while body.len() < content_length {
                let n = stream.read(&mut buf).unwrap();
                body.extend_from_slice(&buf[..n]);
            }

            let response_body = if path == "/explain" {
                &explain_body
            } else {
                &analyze_body
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
                len = response_body.len(),
                body = response_body
            );
            stream.write_all(response.as_bytes()).unwrap();
            let _ = tx.send(path);
        }
    });

    (base, rx)
}

fn test_frame() -> CapturedFrame {
    CapturedFrame::from_encoded(vec![0xFF, 0xD8, 0xFF, 0xD9], "image/jpeg", 4, 4)
}

#[test]
fn both_stages_complete_in_order() {
    let analyze_body =
        r#"{"candidates":[{"content":{"parts":[{"text":"{\"items\":[{\"name\":\"rice\",\"calories\":200},{\"name\":\"miso soup\",\"calories\":80}],\"total\":280,\"cooking_method\":\"煮る\"}"}]}}]}"#;
    let explain_body =
        r#"{"candidates":[{"content":{"parts":[{"text":"ご飯と味噌汁で合計280kcalです。"}]}}]}"#;
    let (proxy, rx) = scripted_proxy(analyze_body, explain_body);

    let client = InferenceClient::new(&proxy);
    let cancel = CancelToken::new();

    let analysis = client.analyze_image(&test_frame(), &cancel).unwrap();
    assert_eq!(analysis.items.len(), 2);
    assert_eq!(analysis.total_calories, 280);
    assert_eq!(analysis.cooking_method.as_deref(), Some("煮る"));

    let narrative = client.explain(&analysis, &cancel).unwrap();
    assert!(narrative.text.contains("280"));

    assert_eq!(rx.recv().unwrap(), "/analyze");
    assert_eq!(rx.recv().unwrap(), "/explain");
}

#[test]
fn malformed_vision_body_is_a_shape_error_and_stage_two_never_fires() {
    let analyze_body = r#"{"candidates":[]}"#;
    let (proxy, rx) = scripted_proxy(analyze_body, "{}");

    let client = InferenceClient::new(&proxy);
    let cancel = CancelToken::new();

    let err = client.analyze_image(&test_frame(), &cancel).unwrap_err();
    assert!(matches!(
        err,
        calorie_camera::InferenceError::UpstreamShape(_)
    ));

    assert_eq!(rx.recv().unwrap(), "/analyze");
    assert!(rx.try_recv().is_err());
}

#[test]
fn cancelled_token_aborts_before_any_network_call() {
    // Deliberately unreachable proxy: a cancelled stage must not connect.
    let client = InferenceClient::new("http://127.0.0.1:9");
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = client.analyze_image(&test_frame(), &cancel).unwrap_err();
    assert!(matches!(err, calorie_camera::InferenceError::Cancelled));
}
