// Error to status mapping at the front-end boundary

use picshift::error::ConvertError;
use picshift::transcoder::TranscodeError;

#[test]
fn test_status_codes() {
    let cases = [
        (ConvertError::invalid_path("/.."), 400),
        (ConvertError::unsupported_extension("txt"), 415),
        (ConvertError::UnsupportedFormat("svg".into()), 415),
        (ConvertError::SourceNotFound("/a.jpg".into()), 404),
        (ConvertError::OriginNotFound("http://o/a.jpg".into()), 404),
        (ConvertError::OriginUnreachable("refused".into()), 502),
        (ConvertError::Encode("boom".into()), 500),
        (ConvertError::LockTimeout("key".into()), 500),
    ];

    for (err, status) in cases {
        assert_eq!(err.to_http_status(), status, "{}", err);
    }
}

#[test]
fn test_decode_failure_is_encode_error() {
    let err: ConvertError = TranscodeError::decode_failed("bad header").into();
    assert!(matches!(err, ConvertError::Encode(_)));
}

#[test]
fn test_io_error_kept() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: ConvertError = TranscodeError::Io(io).into();
    assert!(matches!(err, ConvertError::Io(_)));
    assert_eq!(err.to_http_status(), 500);
}
