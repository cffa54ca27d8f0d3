use std::env;
use std::error;

use reqwest::Url;

/// Container health probe: fetches the app metadata endpoint and fails on any
/// non-success status.
fn main() -> Result<(), Box<dyn error::Error>> {
    let args: Vec<String> = env::args().collect();
    let target = args
        .get(1)
        .map(String::as_str)
        .unwrap_or("http://localhost:5000/");

    let url = Url::parse(target)?;

    let body = reqwest::blocking::get(url)?;
    if !body.status().is_success() {
        panic!("Request Failed!")
    }

    Ok(())
}
