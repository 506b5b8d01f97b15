use std::sync::{Arc, Mutex};

use conduit::core::error::EXCEPTION;
use conduit::core::{CleanupAction, DepValue};
use conduit::prelude::*;
use serde_json::{Value, json};
use tokio::sync::mpsc;

static DUPLICATE_USER: ErrorClass = ErrorClass::new("DuplicateUser", &EXCEPTION);

type Log = Arc<Mutex<Vec<String>>>;

fn session(log: Log) -> Factory {
    Factory::from_blocking("session", move |_args| {
        log.lock().unwrap().push("open".to_string());
        let close_log = Arc::clone(&log);
        let step = SingleStep::from_iter(vec![Ok(Arc::new("db".to_string()) as DepValue)])
            .on_close(CleanupAction::blocking(move || {
                close_log.lock().unwrap().push("close".to_string());
                Ok(())
            }));
        Ok(Outcome::single_step(step))
    })
}

fn signup_route(log: Log, welcomed: mpsc::UnboundedSender<String>) -> RouteDescriptor {
    RouteDescriptor::new(
        Method::POST,
        "/users",
        Handler::from_async(move |kw: Kwargs| {
            let welcomed = welcomed.clone();
            async move {
                let name: String = kw.get("name")?;
                let age: i64 = kw.get("age")?;
                let session = kw.dep::<String>("session")?;
                if name == "taken" {
                    return Err(DispatchError::application(&DUPLICATE_USER, "user exists"));
                }
                kw.background().add(
                    move |(tx, name): (mpsc::UnboundedSender<String>, String)| {
                        let _ = tx.send(format!("welcome {name}"));
                    },
                    (welcomed, name.clone()),
                );
                Ok::<_, DispatchError>((
                    StatusCode::CREATED,
                    json!({ "name": name, "age": age, "session": session.as_str() }),
                ))
            }
        }),
    )
    .param(ParamSpec::body("name", FieldShape::Str))
    .param(ParamSpec::body("age", FieldShape::Int))
    .dependency("session", session(log))
}

fn runtime() -> ConduitRuntime {
    let mut runtime = ConduitRuntime::builder()
        .without_env()
        .without_logging()
        .config(ConduitConfig::default())
        .build()
        .unwrap();
    runtime
        .exception_handlers_mut()
        .register_blocking(&DUPLICATE_USER, |_view, err| {
            (StatusCode::CONFLICT, json!({ "error": err.to_string() }))
        });
    runtime
}

async fn post(endpoint: &conduit::framework::Endpoint, body: Value) -> (StatusCode, Value) {
    let (status, body, _) = endpoint
        .call(body.to_string(), vec![], "", HeaderMap::new())
        .await;
    (status, body.json().unwrap())
}

#[tokio::test]
async fn signup_end_to_end() {
    let log: Log = Arc::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let runtime = runtime();
    let endpoint = runtime.endpoint(signup_route(Arc::clone(&log), tx));

    let (status, body) = post(&endpoint, json!({ "name": "ada", "age": 36 })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "name": "ada", "age": 36, "session": "db" }));
    assert_eq!(*log.lock().unwrap(), vec!["open", "close"]);
    assert_eq!(rx.recv().await.as_deref(), Some("welcome ada"));

    let (status, body) = post(&endpoint, json!({ "name": "taken", "age": 1 })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("user exists"));

    let (status, body) = post(&endpoint, json!({ "name": "bob", "age": "old" })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["detail"][0]["loc"], json!(["body", "age"]));
    assert_eq!(body["detail"][0]["type"], "int_parsing");
    assert_eq!(log.lock().unwrap().len(), 6);

    runtime.shutdown().await;
}
