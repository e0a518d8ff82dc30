//! OpenAPI schema generator for the monitor API, mirroring the teacher's
//! `openapi_dump` binary: freezes the schema to disk without starting the
//! server, for CI and client generation.

use utoipa::OpenApi;

use gqfi::monitor::ApiDoc;

fn main() {
    let openapi = ApiDoc::openapi();
    let json = serde_json::to_string_pretty(&openapi).expect("failed to serialize OpenAPI spec");

    let output_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "openapi.json".to_string());

    std::fs::write(&output_path, json)
        .unwrap_or_else(|e| panic!("failed to write OpenAPI spec to {output_path}: {e}"));

    eprintln!("OpenAPI spec written to {output_path}");
}
