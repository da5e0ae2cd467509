use std::sync::{Arc, Mutex};

use plex_tokio::{memory_pair, Method, MethodTable, RemoteError, SessionBuilder, Value};

fn joined(args: &[Value]) -> Value {
    let words: Vec<&str> = args.iter().filter_map(Value::as_str).collect();
    Value::from(words.join(" "))
}

#[tokio::test]
async fn static_in_args_prefix_served_calls() {
    let table = MethodTable::new()
        .with(Method::handler("test", |args| async move {
            Ok::<_, RemoteError>(vec![joined(&args)])
        }))
        .unwrap();
    let (a, b) = memory_pair(64 * 1024);
    let (client, _) = SessionBuilder::new(MethodTable::new()).connect(a);
    let (_server, _) = SessionBuilder::new(table)
        .static_in_args(vec![Value::from("foo"), Value::from("bar")])
        .connect(b);

    client.remote_methods().await.unwrap();
    let result = client.call("test", vec![Value::from("baz")]).await.unwrap();
    assert_eq!(result, vec![Value::from("foo bar baz")]);
}

#[tokio::test]
async fn static_out_args_append_to_results_locally() {
    let seen: Arc<Mutex<Vec<Vec<Value>>>> = Arc::default();
    let table = MethodTable::new()
        .with(Method::handler("echo", {
            let seen = seen.clone();
            move |args| {
                seen.lock().unwrap().push(args.clone());
                async move { Ok::<_, RemoteError>(args) }
            }
        }))
        .unwrap()
        .with(Method::callback("fail", |_, done| done.err("nope")))
        .unwrap();
    let (a, b) = memory_pair(64 * 1024);
    let (client, _) = SessionBuilder::new(MethodTable::new()).connect(a);
    let (_server, _) = SessionBuilder::new(table).connect(b);
    client.set_static_out_args(vec![Value::from("trailer")]);
    let methods = client.remote_methods().await.unwrap();

    let result = methods.call("echo", vec![Value::Int(1)]).await.unwrap();
    assert_eq!(result, vec![Value::Int(1), Value::from("trailer")]);
    assert_eq!(*seen.lock().unwrap(), vec![vec![Value::Int(1)]]);

    assert!(methods.call("fail", vec![]).await.is_err());
}

#[tokio::test]
async fn static_args_can_change_between_calls() {
    let table = MethodTable::new()
        .with(Method::handler("test", |args| async move {
            Ok::<_, RemoteError>(vec![joined(&args)])
        }))
        .unwrap();
    let (a, b) = memory_pair(64 * 1024);
    let (client, _) = SessionBuilder::new(MethodTable::new()).connect(a);
    let (server, _) = SessionBuilder::new(table).connect(b);
    let methods = client.remote_methods().await.unwrap();

    assert_eq!(
        methods.call("test", vec![Value::from("x")]).await.unwrap(),
        vec![Value::from("x")]
    );
    server.set_static_in_args(vec![Value::from("pre")]);
    assert_eq!(
        methods.call("test", vec![Value::from("x")]).await.unwrap(),
        vec![Value::from("pre x")]
    );
}
