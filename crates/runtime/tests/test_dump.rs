//! Binary chunk round trips through the runtime and the filesystem.

use std::io::Write;

use selune_runtime::{Runtime, Status};

fn compile_to_chunk(src: &str) -> Vec<u8> {
    let mut rt = Runtime::with_corelib();
    let status = rt.load_buffer(src.as_bytes(), b"=dump-src", "t");
    assert_eq!(status, Status::Ok);
    rt.dump_top(false).expect("script functions dump")
}

#[test]
fn load_dump_load_preserves_behavior() {
    let chunk = compile_to_chunk("return 6 * 7");
    let mut rt = Runtime::with_corelib();
    let status = rt.load_buffer(&chunk, b"=reloaded", "b");
    assert_eq!(status, Status::Ok);
    assert_eq!(rt.pcall(0, 1, 0), Status::Ok);
    assert_eq!(rt.to_integer(-1), Some(42));
}

#[test]
fn chunk_survives_file_round_trip() {
    let chunk = compile_to_chunk(
        r#"
        local acc = 0
        for i = 1, 10 do acc = acc + i end
        return acc
    "#,
    );
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(&chunk).expect("write chunk");
    let read_back = std::fs::read(file.path()).expect("read chunk");
    assert_eq!(read_back, chunk);

    let mut rt = Runtime::with_corelib();
    assert_eq!(rt.load_buffer(&read_back, b"@chunkfile", "b"), Status::Ok);
    assert_eq!(rt.pcall(0, 1, 0), Status::Ok);
    assert_eq!(rt.to_integer(-1), Some(55));
}

#[test]
fn dumped_closures_carry_nested_functions() {
    let chunk = compile_to_chunk(
        r#"
        local function outer(n)
            local function inner(m) return m + n end
            return inner(10)
        end
        return outer(32)
    "#,
    );
    let mut rt = Runtime::with_corelib();
    assert_eq!(rt.load_buffer(&chunk, b"=nested", "b"), Status::Ok);
    assert_eq!(rt.pcall(0, 1, 0), Status::Ok);
    assert_eq!(rt.to_integer(-1), Some(42));
}

#[test]
fn stripped_chunks_still_run() {
    let mut rt = Runtime::with_corelib();
    assert_eq!(rt.load_buffer(b"return 'ok'", b"=strip-src", "t"), Status::Ok);
    let chunk = rt.dump_top(true).expect("dumps");
    rt.pop(1);
    assert_eq!(rt.load_buffer(&chunk, b"=stripped", "b"), Status::Ok);
    assert_eq!(rt.pcall(0, 1, 0), Status::Ok);
    assert_eq!(rt.to_rust_string(-1).as_deref(), Some("ok"));
}

#[test]
fn corrupt_chunks_are_rejected_with_reason() {
    let mut chunk = compile_to_chunk("return 1");
    chunk[4] = 0x99; // version byte
    let mut rt = Runtime::with_corelib();
    let status = rt.load_buffer(&chunk, b"=bad", "b");
    assert_eq!(status, Status::ErrSyntax);
    let msg = rt.to_rust_string(-1).unwrap();
    assert!(msg.contains("version mismatch"), "got {msg}");
}

#[test]
fn truncated_chunks_are_rejected() {
    let chunk = compile_to_chunk("return 1 + 2");
    let mut rt = Runtime::with_corelib();
    let status = rt.load_buffer(&chunk[..chunk.len() / 2], b"=trunc", "b");
    assert_eq!(status, Status::ErrSyntax);
    let msg = rt.to_rust_string(-1).unwrap();
    assert!(msg.contains("truncated"), "got {msg}");
}

#[test]
fn debug_info_survives_round_trip() {
    // Line info must survive so runtime errors in reloaded chunks
    // still report positions.
    let chunk = compile_to_chunk("\n\nreturn nil + 1");
    let mut rt = Runtime::with_corelib();
    assert_eq!(rt.load_buffer(&chunk, b"=positions", "b"), Status::Ok);
    let status = rt.pcall(0, 0, 0);
    assert_eq!(status, Status::ErrRun);
    let msg = rt.to_rust_string(-1).unwrap();
    assert!(msg.contains(":3:"), "got {msg}");
}
