#![allow(dead_code)]

use std::path::{Path, PathBuf};

use lobrec_recorder::Config;

pub fn config(data_dir: &Path, instruments: &[&str], flush_interval: &str) -> Config {
    let instruments = instruments
        .iter()
        .map(|i| format!("\"{}\"", i))
        .collect::<Vec<_>>()
        .join(", ");
    Config::from_yaml(&format!(
        r#"
feed:
  url: "wss://api.hyperliquid.xyz/ws"
  instruments: [{instruments}]
  channels: ["l2Book"]
  ping_interval: 50s
  staleness_window: 100s
storage:
  data_dir: "{}"
flush:
  interval: {flush_interval}
shutdown_grace: 15s
"#,
        data_dir.display()
    ))
    .expect("valid test config")
}

/// One `l2Book` frame with a single level per side.
pub fn book_frame(coin: &str, time_ms: i64, bid: f64, ask: f64) -> String {
    format!(
        r#"{{"channel":"l2Book","data":{{"coin":"{coin}","time":{time_ms},"levels":[[{{"px":"{bid}","sz":"1.5","n":2}}],[{{"px":"{ask}","sz":"0.5","n":1}}]]}}}}"#
    )
}

pub fn subscribe_ack(coin: &str) -> String {
    format!(
        r#"{{"channel":"subscriptionResponse","data":{{"method":"subscribe","subscription":{{"type":"l2Book","coin":"{coin}"}}}}}}"#
    )
}

/// Every committed parquet file under `dir`, recursively.
pub fn parquet_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            files.extend(parquet_files(&path));
        } else if path.extension().is_some_and(|ext| ext == "parquet") {
            files.push(path);
        }
    }
    files.sort();
    files
}

/// Any leftover temporary files under `dir`, recursively.
pub fn tmp_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            files.extend(tmp_files(&path));
        } else if path.extension().is_some_and(|ext| ext == "tmp") {
            files.push(path);
        }
    }
    files
}
