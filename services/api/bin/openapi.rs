//! Writes the monitoring API's OpenAPI document to disk.
//!
//! Usage: `openapi [OUTPUT]` (defaults to `openapi.json`).

use avatar_api::router::ApiDoc;
use utoipa::OpenApi;

fn main() -> anyhow::Result<()> {
    let output = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "openapi.json".to_string());
    let spec_json = ApiDoc::openapi().to_pretty_json()?;
    std::fs::write(&output, spec_json)?;
    println!("Wrote OpenAPI spec to {output}");
    Ok(())
}
