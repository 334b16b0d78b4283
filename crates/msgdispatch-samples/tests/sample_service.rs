//! The sample service, driven through its client.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use msgdispatch::{
    Connection, Dispatcher, DispatcherConfig, DispatcherHandle, OpenFlags, ServiceEndpoint,
};
use msgdispatch::protocol::HEADER;
use msgdispatch_samples::sample::{
    self, A_FEW_BYTES, COMP_FACT, ERROR_CODE, ROUND_TRIP, Reply, RoundTrip, SampleClient, T_ERROR,
};

struct SampleServer {
    _dir: TempDir,
    client: SampleClient,
    handle: Option<DispatcherHandle>,
}

impl Drop for SampleServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
            let _ = handle.join();
        }
    }
}

#[fixture]
fn server() -> SampleServer {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("sample.sock");
    let endpoint = ServiceEndpoint::path(path.to_str().expect("utf8 path"));
    let config = DispatcherConfig::default().with_poll_timeout(Some(Duration::from_millis(20)));
    let handle = Dispatcher::new(sample::registry().expect("registry"), config)
        .spawn(&endpoint)
        .expect("spawn sample server");
    SampleServer {
        _dir: dir,
        client: SampleClient::new(endpoint),
        handle: Some(handle),
    }
}

#[rstest]
#[case(5, Reply::Value(120))]
#[case(10, Reply::Value(3_628_800))]
#[case(12, Reply::Value(479_001_600))]
#[case(15, Reply::Error(ERROR_CODE))]
#[case(-7, Reply::Error(ERROR_CODE))]
fn factorials(server: SampleServer, #[case] n: i32, #[case] expected: Reply<i32>) {
    assert_eq!(server.client.factorial(n).expect("exchange"), expected);
}

#[rstest]
fn round_trip_mirrors_every_field(server: SampleServer) {
    let fields = RoundTrip {
        type_code: 2500,
        unsigned64: 18_446_743_967_598_447_505,
        signed64: -9_223_372_036_854_775_807,
        unsigned32: 2_147_477_648,
        signed32: -6000,
        unsigned16: 512,
        unsigned8: 255,
        text: "Hello Earth!".to_string(),
    };
    assert_eq!(
        server.client.round_trip(&fields).expect("exchange"),
        Reply::Value(fields)
    );
}

#[rstest]
fn round_trip_rejects_malformed_text(server: SampleServer) {
    let mut connection =
        Connection::connect(server.client.endpoint(), OpenFlags::LOCAL).expect("open");
    connection.write_type(ROUND_TRIP).expect("type");
    connection.write_type(1).expect("inner type");
    connection.write_u64(1).expect("u64");
    connection.write_i64(1).expect("i64");
    connection.write_u32(1).expect("u32");
    connection.write_i32(1).expect("i32");
    connection.write_u16(1).expect("u16");
    connection.write_u8(1).expect("u8");
    // A two-byte sequence that is not UTF-8.
    connection.write_bytes(&[0xC3, 0x28]).expect("bytes");

    assert_eq!(connection.read_type().expect("reply tag"), T_ERROR);
    assert_eq!(connection.read_u16().expect("error code"), ERROR_CODE);
}

#[rstest]
fn a_few_bytes_reports_total_length(server: SampleServer) {
    let first = b"The Quick Brown Fox".as_slice();
    let second = [0_u8; 300];
    let third = b"".as_slice();

    let reply = server
        .client
        .a_few_bytes([first, &second, third])
        .expect("exchange");
    let Reply::Value((total, sequences)) = reply else {
        panic!("expected a result reply, got {reply:?}");
    };
    assert_eq!(total, 319);
    assert_eq!(sequences, [first.to_vec(), second.to_vec(), Vec::new()]);
}

#[rstest]
fn a_few_bytes_answers_a_null_marker_with_an_error(server: SampleServer) {
    let mut connection =
        Connection::connect(server.client.endpoint(), OpenFlags::LOCAL).expect("open");
    connection.write_type(A_FEW_BYTES).expect("type");
    connection.write_optional_string(None).expect("null marker");

    assert_eq!(connection.read_type().expect("reply tag"), T_ERROR);
    assert_eq!(connection.read_u16().expect("error code"), ERROR_CODE);
}

#[rstest]
fn zero_device_descriptor_reads_zeros(server: SampleServer) {
    let Reply::Value(mut file) = server.client.open_zero().expect("exchange") else {
        panic!("expected a descriptor");
    };
    let mut buffer = [0xAA_u8; 64];
    file.read_exact(&mut buffer).expect("read /dev/zero");
    assert_eq!(buffer, [0_u8; 64]);
}

#[rstest]
fn random_device_descriptor_is_readable(server: SampleServer) {
    let Reply::Value(mut file) = server.client.open_random().expect("exchange") else {
        panic!("expected a descriptor");
    };
    let mut buffer = [0_u8; 32];
    file.read_exact(&mut buffer).expect("read /dev/urandom");
}

#[rstest]
fn server_survives_a_refused_request(server: SampleServer) {
    assert_eq!(
        server.client.factorial(30).expect("exchange"),
        Reply::Error(ERROR_CODE)
    );
    assert_eq!(server.client.factorial(7).expect("exchange"), Reply::Value(5040));
}

#[rstest]
fn truncated_factorial_request_gets_an_error_reply(server: SampleServer) {
    let path = server
        .client
        .endpoint()
        .filesystem_path()
        .expect("path endpoint")
        .to_path_buf();
    let mut stream = UnixStream::connect(path.as_std_path()).expect("connect raw client");
    stream.write_all(&HEADER).expect("header");
    stream.write_all(&COMP_FACT.to_be_bytes()).expect("type code");
    // Half of the i32 argument, then no more bytes.
    stream.write_all(&[0, 0]).expect("partial argument");
    stream.shutdown(Shutdown::Write).expect("half close");

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).expect("read reply");
    let mut expected = T_ERROR.to_be_bytes().to_vec();
    expected.extend_from_slice(&ERROR_CODE.to_be_bytes());
    assert_eq!(reply, expected);
}
