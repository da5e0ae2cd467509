use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::FutureExt;
use plex_tokio::{
    memory_pair, CallError, Encoding, LocalStream, Method, MethodTable, RemoteMethods,
    SessionBuilder, StreamFuture, StreamSpec, Value,
};

fn path_arg(args: &[Value], i: usize) -> PathBuf {
    PathBuf::from(args.get(i).and_then(Value::as_str).unwrap_or_default())
}

fn open(path: PathBuf) -> StreamFuture {
    async move { Ok(LocalStream::reader(tokio::fs::File::open(path).await?)) }.boxed()
}

fn create(path: PathBuf) -> StreamFuture {
    async move { Ok(LocalStream::writer(tokio::fs::File::create(path).await?)) }.boxed()
}

fn file_table() -> MethodTable {
    MethodTable::new()
        .with(Method::sync_read_streams(
            "multiRead",
            Encoding::Utf8,
            2,
            |args| vec![open(path_arg(&args, 0)), open(path_arg(&args, 1))],
        ))
        .unwrap()
        .with(Method::sync_streams(
            "multiRW",
            vec![StreamSpec::read(Encoding::Utf8), StreamSpec::write(Encoding::Utf8)],
            |args| vec![open(path_arg(&args, 0)), create(path_arg(&args, 1))],
        ))
        .unwrap()
}

async fn client_for(table: MethodTable) -> RemoteMethods {
    let (a, b) = memory_pair(64 * 1024);
    let (client, _) = SessionBuilder::new(MethodTable::new()).connect(a);
    let (_server, _) = SessionBuilder::new(table).connect(b);
    client.remote_methods().await.unwrap()
}

fn arg(path: &Path) -> Value {
    Value::from(path.to_string_lossy().into_owned())
}

#[tokio::test]
async fn multi_read_delivers_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let foo = dir.path().join("foo.txt");
    let foo2 = dir.path().join("foo2.txt");
    tokio::fs::write(&foo, "first file\n").await.unwrap();
    tokio::fs::write(&foo2, "second file, ünïcödé\n").await.unwrap();
    let methods = client_for(file_table()).await;

    let streams = methods
        .get("multiRead")
        .unwrap()
        .open_sync_streams(vec![arg(&foo), arg(&foo2)])
        .await
        .unwrap();
    assert_eq!(streams.len(), 2);
    let mut texts = Vec::new();
    for stream in streams {
        texts.push(stream.into_reader().unwrap().read_to_string().await.unwrap());
    }
    assert_eq!(texts, vec!["first file\n", "second file, ünïcödé\n"]);
}

#[tokio::test]
async fn multi_rw_pairs_a_reader_with_a_writer() {
    let dir = tempfile::tempdir().unwrap();
    let foo = dir.path().join("foo.txt");
    let out = dir.path().join("out.txt");
    tokio::fs::write(&foo, "source").await.unwrap();
    let methods = client_for(file_table()).await;

    let mut streams = methods
        .get("multiRW")
        .unwrap()
        .open_sync_streams(vec![arg(&foo), arg(&out)])
        .await
        .unwrap()
        .into_iter();
    let reader = streams.next().unwrap().into_reader().unwrap();
    let mut writer = streams.next().unwrap().into_writer().unwrap();

    assert_eq!(reader.read_to_string().await.unwrap(), "source");
    writer.write_all(b"copied").await.unwrap();
    writer.close().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::fs::read_to_string(&out).await.unwrap_or_default() != "copied" {
        assert!(tokio::time::Instant::now() < deadline, "write never landed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn one_failing_member_fails_the_whole_call() {
    let dir = tempfile::tempdir().unwrap();
    let foo = dir.path().join("foo.txt");
    tokio::fs::write(&foo, "present").await.unwrap();
    let missing = dir.path().join("missing.txt");
    let methods = client_for(file_table()).await;

    let result = methods
        .get("multiRead")
        .unwrap()
        .open_sync_streams(vec![arg(&foo), arg(&missing)])
        .await;
    assert!(matches!(result, Err(CallError::StreamFailed(_))));

    // The session survives for later calls.
    let streams = methods
        .get("multiRead")
        .unwrap()
        .open_sync_streams(vec![arg(&foo), arg(&foo)])
        .await
        .unwrap();
    assert_eq!(streams.len(), 2);
}

#[tokio::test]
async fn wrong_stub_for_the_shape_is_rejected_locally() {
    let methods = client_for(file_table()).await;
    let stub = methods.get("multiRead").unwrap();
    assert!(matches!(
        stub.call(vec![]).await,
        Err(CallError::ShapeMismatch(_))
    ));
    assert!(matches!(
        stub.open_stream(vec![]).await,
        Err(CallError::ShapeMismatch(_))
    ));
    assert_eq!(
        methods.call("multiRead", vec![]).await.err(),
        Some(CallError::ShapeMismatch("multiRead".into()))
    );
}
