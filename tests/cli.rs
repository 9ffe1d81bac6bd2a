#![cfg(feature = "cli")]

use std::io::Write;

use record_store::cli::read_source_file;

#[tokio::test]
async fn reads_json_lines_skipping_bad_ones() -> Result<(), Box<dyn std::error::Error>> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, r#"{{"resourceId": "r1", "service": "EC2", "region": "us-east-1", "cost": 40}}"#)?;
    writeln!(file)?;
    writeln!(file, "{{broken")?;
    writeln!(file, r#"{{"id": "vm-2", "serviceLabel": "Virtual Machines", "monthlyCost": 12.5, "source": "azure"}}"#)?;
    file.flush()?;

    let (source, malformed) = read_source_file(file.path()).await?;
    assert_eq!(malformed, 1);
    assert_eq!(source.candidates.len(), 2);
    assert_eq!(source.candidates[0].monthly_cost, Some(40.0));
    assert_eq!(source.candidates[1].id.as_deref(), Some("vm-2"));
    assert_eq!(source.name, file.path().file_name().unwrap().to_string_lossy());
    Ok(())
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(read_source_file(&dir.path().join("nope.jsonl")).await.is_err());
}
