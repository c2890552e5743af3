//! Loading the shared TOML config file named by `CALCAM_CONFIG`.
//!
//! Kept as a single test: the loaders read process environment, and the
//! env var must not be mutated concurrently.

use std::io::Write;

use calorie_camera::{CalcamConfig, ProxySettings};

#[test]
fn client_and_proxy_sections_load_from_one_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
proxy_url = "http://127.0.0.1:9100"

[camera]
source = "stub://table"
width = 640
height = 480
jpeg_quality = 70
rotation = 90

[proxy]
addr = "127.0.0.1:9100"
upstream_url = "https://upstream.example/v1beta"
vision_model = "gemini-vision-test"
"#
    )
    .unwrap();

    std::env::set_var("CALCAM_CONFIG", file.path());
    let client = CalcamConfig::load().unwrap();
    let proxy = ProxySettings::load().unwrap();
    std::env::remove_var("CALCAM_CONFIG");

    assert_eq!(client.proxy_url, "http://127.0.0.1:9100");
    assert_eq!(client.camera.source, "stub://table");
    assert_eq!(client.camera.jpeg_quality, 70);
    assert_eq!(client.camera.rotation, 90);

    assert_eq!(proxy.addr, "127.0.0.1:9100");
    assert_eq!(proxy.upstream_url, "https://upstream.example/v1beta");
    assert_eq!(proxy.vision_model, "gemini-vision-test");
    // Unset keys fall back to defaults.
    assert_eq!(proxy.generation_model, "gemini-2.0-flash");
}
