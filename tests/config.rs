use std::fs;

use assert_matches::assert_matches;

use gpmdap::app::FailurePolicy;
use gpmdap::config::ConfigLoader;
use gpmdap::error::GpmError;

#[test]
fn request_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpmdap.json");
    fs::write(
        &path,
        r#"{
            "product": "3IMERGHHE",
            "variables": ["precipitationCal"],
            "start_date": "2019-06-01",
            "end_date": "2019-06-03",
            "bbox": {"min_lat": -33, "max_lat": 3, "min_lon": -72, "max_lon": -35},
            "failure_policy": "skip_and_report"
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.request.product, "3IMERGHHE");
    assert_eq!(resolved.request.dates.days().len(), 3);
    assert_eq!(resolved.options.failure_policy, FailurePolicy::SkipAndReport);
}

#[test]
fn unreadable_and_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(GpmError::ConfigRead(_))
    );

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ product: }").unwrap();
    assert_matches!(
        ConfigLoader::resolve(broken.to_str()),
        Err(GpmError::ConfigParse(_))
    );

    let bad_box = dir.path().join("bad_box.json");
    fs::write(
        &bad_box,
        r#"{"product": "3IMERGHH", "variables": "precipitationCal",
            "start_date": "2020-01-01", "end_date": "2020-01-01",
            "bbox": {"min_lat": 5, "max_lat": 3, "min_lon": 0, "max_lon": 1}}"#,
    )
    .unwrap();
    assert_matches!(
        ConfigLoader::resolve(bad_box.to_str()),
        Err(GpmError::InvalidBoundingBox(_))
    );
}
