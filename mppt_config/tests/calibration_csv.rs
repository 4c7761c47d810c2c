use std::fs::File;
use std::io::Write;

use mppt_config::{LinearCal, fit_channel, load_calibration_csv};
use rstest::rstest;
use tempfile::tempdir;

fn write_csv(body: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cal.csv");
    let mut f = File::create(&path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    (dir, path)
}

#[rstest]
fn two_point_fit_is_exact() {
    // milli = 2*raw - 100  =>  m = 2000, b = -100000
    let cal = fit_channel(&[(100, 100.0), (200, 300.0)]).unwrap();
    assert_eq!(cal, LinearCal { m: 2000, b: -100_000 });
}

#[rstest]
#[case(&[(100, 1.0)], "at least two rows")]
#[case(&[(100, 1.0), (100, 2.0)], "duplicate raw")]
#[case(&[(100, 5.0), (200, 5.0)], "slope")]
fn degenerate_rows_are_rejected(#[case] pts: &[(i64, f64)], #[case] needle: &str) {
    let err = fit_channel(pts).unwrap_err();
    assert!(
        err.to_string().contains(needle),
        "expected '{needle}' in '{err}'"
    );
}

#[rstest]
fn csv_fits_each_channel_independently() {
    let (_dir, path) = write_csv(
        "channel,raw,milli\n\
         vin,1000,40151.385\n\
         iin,1000,2572\n\
         vin,3000,121195.385\n\
         iin,3000,7732\n",
    );
    let cal = load_calibration_csv(&path).unwrap();
    assert_eq!(cal.vin, Some(LinearCal { m: 40522, b: -370_615 }));
    assert_eq!(cal.iin, Some(LinearCal { m: 2580, b: -8000 }));
    assert_eq!(cal.vout, None);
}

#[rstest]
fn csv_rejects_wrong_headers() {
    let (_dir, path) = write_csv("raw,grams\n1,2\n3,4\n");
    let err = load_calibration_csv(&path).unwrap_err();
    assert!(err.to_string().contains("channel,raw,milli"));
}

#[rstest]
fn csv_rejects_unknown_channel() {
    let (_dir, path) = write_csv("channel,raw,milli\nbogus,1,1\nbogus,2,2\n");
    let err = load_calibration_csv(&path).unwrap_err();
    assert!(err.to_string().contains("unknown channel"));
}

#[rstest]
fn csv_reports_bad_row_number() {
    let (_dir, path) = write_csv("channel,raw,milli\nvin,1,1\nvin,oops,2\n");
    let err = load_calibration_csv(&path).unwrap_err();
    assert!(err.to_string().contains("row 3"), "{err}");
}
