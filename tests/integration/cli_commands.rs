#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use bytes::Bytes;
use colstore::{
    storage::attstream::{encode_chunks, AttItem, AttrType, Datum},
    types::{page::write_tag, Tid},
};
use serde_json::Value;
use tempfile::TempDir;

fn init_relation(dir: &Path, seed_rows: usize) -> PathBuf {
    let path = dir.join("cli.col");
    cargo_bin_cmd!("colstore")
        .args(["init", "--attr", "int8", "--attr", "text", "--seed-rows"])
        .arg(seed_rows.to_string())
        .arg(&path)
        .assert()
        .success();
    path
}

fn json(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("colstore")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn meta_reports_fresh_relation() {
    let dir = TempDir::new().unwrap();
    let path = init_relation(dir.path(), 0);
    let meta = json(&["meta"], &path);
    assert_eq!(meta["undo_head"], meta["undo_tail"]);
    assert_eq!(meta["flags"], 0);
    assert_eq!(meta["natts"], 2);
    assert_eq!(meta["roots"].as_array().unwrap().len(), 3);
}

#[test]
fn seeded_relation_lists_pages() {
    let dir = TempDir::new().unwrap();
    let path = init_relation(dir.path(), 2_000);

    let undo = json(&["undo-pages"], &path);
    let total: u64 = undo
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["record_count"].as_u64().unwrap())
        .sum();
    assert_eq!(total, 2_000);

    let toast = json(&["toast-pages"], &path);
    assert!(!toast.as_array().unwrap().is_empty());

    let btree = json(&["btree-pages"], &path);
    let rows = btree.as_array().unwrap();
    assert!(rows.iter().any(|r| r["level"].as_u64() == Some(1)));
    let internal = rows.iter().find(|r| r["level"].as_u64() == Some(1)).unwrap();
    assert!(internal["stored_size"].is_null());

    let leaf = rows
        .iter()
        .find(|r| r["level"].as_u64() == Some(0) && r["attno"].as_u64() == Some(1))
        .unwrap();
    let block = leaf["block"].as_u64().unwrap().to_string();
    let output = cargo_bin_cmd!("colstore")
        .args(["--format", "json", "dump-attstreams"])
        .arg(&path)
        .arg(&block)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let chunks: Value = serde_json::from_slice(&output).unwrap();
    let chunks = chunks.as_array().unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c["attno"].as_u64() == Some(1)));

    let report = json(&["verify", "--level", "full"], &path);
    assert_eq!(report["success"], true);
}

#[test]
fn page_type_handles_unknown_tags() {
    let dir = TempDir::new().unwrap();
    let path = init_relation(dir.path(), 0);
    let output = cargo_bin_cmd!("colstore")
        .args(["page-type"])
        .arg(&path)
        .arg("0")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8(output).unwrap().trim(), "0: META");

    // Stamp a foreign tag on block 1 and skip checksum checks when reading.
    let mut bytes = fs::read(&path).unwrap();
    let page = &mut bytes[8192..16384];
    write_tag(page, 0x7777);
    fs::write(&path, &bytes).unwrap();
    let output = cargo_bin_cmd!("colstore")
        .args(["--no-verify-checksums", "page-type"])
        .arg(&path)
        .arg("1")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert_eq!(text.trim(), "1: UNKNOWN 0x7777");
}

#[test]
fn decode_chunk_reads_hex() {
    let items = vec![
        AttItem::new(Tid(5), Datum::Value(Bytes::copy_from_slice(&7i64.to_be_bytes()))),
        AttItem::new(Tid(9), Datum::Null),
    ];
    let raw = encode_chunks(AttrType::by_value(8).unwrap(), Tid(2), &items).unwrap();
    let output = cargo_bin_cmd!("colstore")
        .args([
            "--format",
            "json",
            "decode-chunk",
            "--by-value",
            "--length",
            "8",
            "--prev-tid",
            "2",
            "--last-tid",
            "9",
        ])
        .arg(hex::encode(raw))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let row: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(row["count"], 2);
    assert_eq!(row["tids"], serde_json::json!([5, 9]));
    assert_eq!(row["nulls"], serde_json::json!([false, true]));
}

#[test]
fn missing_relation_fails() {
    let dir = TempDir::new().unwrap();
    cargo_bin_cmd!("colstore")
        .arg("meta")
        .arg(dir.path().join("nope.col"))
        .assert()
        .failure()
        .code(1);
}

#[test]
fn config_file_sets_store_options() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, "[store]\ncompression = \"none\"\ncache_pages = 32\n").unwrap();
    let path = dir.path().join("configured.col");
    cargo_bin_cmd!("colstore")
        .arg("--config")
        .arg(&config)
        .args(["init", "--attr", "int4", "--seed-rows", "500"])
        .arg(&path)
        .assert()
        .success();
    let rows = json(&["btree-pages"], &path);
    let leaf = rows
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["attno"].as_u64() == Some(1) && r["item_count"].as_u64().unwrap_or(0) > 0)
        .unwrap()
        .clone();
    assert_eq!(leaf["compressed_count"], 0);

    cargo_bin_cmd!("colstore")
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("meta")
        .arg(&path)
        .assert()
        .failure();
}
