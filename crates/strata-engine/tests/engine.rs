use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use strata_engine::{
    CancelToken, DatasetStore, DeploymentContext, EngineConfig, EngineError, ExecutionRequest,
    ExtensionInitializer, ExtensionRegistry, ExtensionUsage, GlobalContext, Namespace, Schema,
    ScopeContext, Session, SqliteStore, Value,
};

const OWNER: &[u8] = b"owner";
const STRANGER: &[u8] = b"stranger";

async fn context_with(config: EngineConfig) -> GlobalContext {
    let store: Arc<dyn DatasetStore> = Arc::new(SqliteStore::connect(&config).await.unwrap());
    let registry = Arc::new(ExtensionRegistry::with_builtins());
    GlobalContext::new(registry, store, config).await.unwrap()
}

async fn context() -> GlobalContext {
    context_with(EngineConfig::default()).await
}

fn users_schema(procedures: Json) -> Schema {
    serde_json::from_value(json!({
        "name": "users",
        "tables": [{
            "name": "users",
            "columns": [
                {"name": "id", "type": "int", "attributes": [{"kind": "PRIMARY_KEY"}]},
                {"name": "name", "type": "text"}
            ]
        }],
        "procedures": procedures
    }))
    .unwrap()
}

fn user_procedures() -> Json {
    json!([
        {
            "name": "create_user",
            "parameters": ["$id", "$name"],
            "public": true,
            "statements": ["INSERT INTO users (id, name) VALUES ($id, $name);"]
        },
        {
            "name": "get_user",
            "parameters": ["$id"],
            "public": true,
            "modifiers": ["VIEW"],
            "statements": ["SELECT id, name FROM users WHERE id = $id;"]
        },
        {
            "name": "rename_first",
            "modifiers": ["OWNER"],
            "statements": ["UPDATE users SET name = 'renamed' WHERE id = 1;"]
        },
        {
            "name": "forward",
            "public": true,
            "statements": ["rename_first();"]
        }
    ])
}

fn kv_schema(value_column: &str) -> Schema {
    serde_json::from_value(json!({
        "name": "settings",
        "extensions": [{
            "name": "keyvalue",
            "alias": "kv",
            "config": [
                {"key": "table", "value": "'settings'"},
                {"key": "key", "value": "'k'"},
                {"key": "value", "value": format!("'{value_column}'")}
            ]
        }],
        "tables": [{
            "name": "settings",
            "columns": [
                {"name": "k", "type": "text", "attributes": [{"kind": "PRIMARY_KEY"}]},
                {"name": "v", "type": "text"}
            ]
        }],
        "procedures": [
            {
                "name": "put",
                "parameters": ["$k", "$v"],
                "public": true,
                "statements": ["kv.set($k, $v);"]
            },
            {
                "name": "fetch",
                "parameters": ["$k"],
                "public": true,
                "modifiers": ["VIEW"],
                "statements": ["$v = kv.get($k);", "SELECT $v AS v;"]
            }
        ]
    }))
    .unwrap()
}

fn directory_schema(users_dbid: &str) -> Schema {
    serde_json::from_value(json!({
        "name": "directory",
        "extensions": [{"name": users_dbid, "alias": "people"}],
        "procedures": [{
            "name": "lookup",
            "parameters": ["$id"],
            "public": true,
            "modifiers": ["VIEW"],
            "statements": ["$uid, $name = people.get_user($id);", "SELECT $name AS name;"]
        }]
    }))
    .unwrap()
}

async fn deploy_users(ctx: &GlobalContext) -> String {
    ctx.create_dataset(users_schema(user_procedures()), OWNER)
        .await
        .unwrap()
}

async fn create_user(ctx: &GlobalContext, dbid: &str, id: i64, name: &str) {
    ctx.execute(ExecutionRequest::new(
        dbid,
        "create_user",
        vec![Value::Int(id), Value::from(name)],
    ))
    .await
    .unwrap();
}

#[tokio::test]
async fn inserted_rows_are_visible_to_queries_and_views() {
    let ctx = context().await;
    let dbid = deploy_users(&ctx).await;
    create_user(&ctx, &dbid, 1, "a").await;

    let rows = ctx.query(&dbid, "SELECT * FROM users").await.unwrap();
    assert_eq!(rows.columns, vec!["id", "name"]);
    assert_eq!(rows.rows, vec![vec![Value::Int(1), Value::from("a")]]);

    let rows = ctx
        .call(ExecutionRequest::new(&dbid, "get_user", vec![Value::Int(1)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows.rows, vec![vec![Value::Int(1), Value::from("a")]]);

    let rows = ctx
        .execute(ExecutionRequest::new(&dbid, "get_user", vec![Value::Int(1)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows.rows, vec![vec![Value::Int(1), Value::from("a")]]);
}

#[tokio::test]
async fn view_with_insert_is_never_deployed() {
    let ctx = context().await;
    let err = ctx
        .create_dataset(
            users_schema(json!([{
                "name": "sneaky",
                "public": true,
                "modifiers": ["VIEW"],
                "statements": ["INSERT INTO users (id, name) VALUES (1, 'a');"]
            }])),
            OWNER,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("read-only procedure contains DML"), "{err}");
    assert!(ctx.list_datasets(None).is_empty());
}

#[tokio::test]
async fn deploying_twice_is_rejected() {
    let ctx = context().await;
    deploy_users(&ctx).await;
    let err = ctx
        .create_dataset(users_schema(user_procedures()), OWNER)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DatasetExists(_)), "{err}");
}

#[tokio::test]
async fn unknown_datasets_and_procedures() {
    let ctx = context().await;
    let err = ctx
        .execute(ExecutionRequest::new("xdeadbeef", "create_user", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DatasetNotFound(_)), "{err}");

    let dbid = deploy_users(&ctx).await;
    let err = ctx
        .execute(ExecutionRequest::new(&dbid, "nope", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProcedureNotFound(_)), "{err}");

    let err = ctx
        .execute(ExecutionRequest::new(&dbid, "rename_first", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PrivateProcedure(_)), "{err}");

    let err = ctx
        .execute(ExecutionRequest::new(&dbid, "create_user", vec![Value::Int(1)]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, EngineError::IncorrectNumberOfArguments { expected: 2, got: 1, .. }),
        "{err}"
    );
}

#[tokio::test]
async fn owner_check_holds_through_public_forwarder() {
    let ctx = context().await;
    let dbid = deploy_users(&ctx).await;
    create_user(&ctx, &dbid, 1, "a").await;

    let err = ctx
        .execute(ExecutionRequest::new(&dbid, "forward", vec![]).with_signer(STRANGER))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotOwner(_)), "{err}");

    ctx.execute(ExecutionRequest::new(&dbid, "forward", vec![]).with_signer(OWNER))
        .await
        .unwrap();
    let rows = ctx.query(&dbid, "SELECT name FROM users").await.unwrap();
    assert_eq!(rows.rows, vec![vec![Value::from("renamed")]]);
}

#[tokio::test]
async fn read_only_paths_refuse_mutation() {
    let ctx = context().await;
    let dbid = deploy_users(&ctx).await;

    let err = ctx
        .call(ExecutionRequest::new(
            &dbid,
            "create_user",
            vec![Value::Int(1), Value::from("a")],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MutativeProcedure(_)), "{err}");

    let err = ctx.query(&dbid, "DELETE FROM users").await.unwrap_err();
    assert!(matches!(err, EngineError::MutativeQuery), "{err}");

    let err = ctx
        .query(&dbid, "SELECT name FROM users WHERE id = $id")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnboundParameters(ref names) if names == &["$id"]));
}

#[tokio::test]
async fn failed_execution_rolls_back() {
    let ctx = context().await;
    let dbid = deploy_users(&ctx).await;
    create_user(&ctx, &dbid, 1, "a").await;

    let err = ctx
        .execute(ExecutionRequest::new(
            &dbid,
            "create_user",
            vec![Value::Int(1), Value::from("duplicate")],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)), "{err}");

    let rows = ctx.query(&dbid, "SELECT name FROM users").await.unwrap();
    assert_eq!(rows.rows, vec![vec![Value::from("a")]]);
}

#[tokio::test]
async fn keyvalue_config_is_validated_at_deploy() {
    let ctx = context().await;
    let err = ctx
        .create_dataset(kv_schema("missing"), OWNER)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Extension { .. }), "{err}");
    assert!(ctx.list_datasets(None).is_empty());

    ctx.create_dataset(kv_schema("v"), OWNER).await.unwrap();
    assert_eq!(ctx.list_datasets(None).len(), 1);
}

#[tokio::test]
async fn keyvalue_get_and_set() {
    let ctx = context().await;
    let dbid = ctx.create_dataset(kv_schema("v"), OWNER).await.unwrap();

    ctx.execute(ExecutionRequest::new(
        &dbid,
        "put",
        vec![Value::from("color"), Value::from("red")],
    ))
    .await
    .unwrap();
    ctx.execute(ExecutionRequest::new(
        &dbid,
        "put",
        vec![Value::from("color"), Value::from("blue")],
    ))
    .await
    .unwrap();

    let fetch = |key: &str| ExecutionRequest::new(&dbid, "fetch", vec![Value::from(key)]);
    let rows = ctx.call(fetch("color")).await.unwrap().unwrap();
    assert_eq!(rows.rows, vec![vec![Value::from("blue")]]);
    let rows = ctx.call(fetch("shape")).await.unwrap().unwrap();
    assert_eq!(rows.rows, vec![vec![Value::Null]]);

    let rows = ctx
        .execute(ExecutionRequest::new(&dbid, "fetch", vec![Value::from("color")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows.rows, vec![vec![Value::from("blue")]]);
}

#[tokio::test]
async fn views_may_not_call_keyvalue_set() {
    let ctx = context().await;
    let mut schema = kv_schema("v");
    schema.procedures.push(
        serde_json::from_value(json!({
            "name": "sneaky_put",
            "parameters": ["$k", "$v"],
            "public": true,
            "modifiers": ["VIEW"],
            "statements": ["kv.set($k, $v);"]
        }))
        .unwrap(),
    );
    let err = ctx.create_dataset(schema, OWNER).await.unwrap_err();
    assert!(
        matches!(err, EngineError::ReadOnlyProcedureCallsMutative { ref callee, .. } if callee == "kv.set"),
        "{err}"
    );
    assert!(ctx.list_datasets(None).is_empty());
}

#[tokio::test]
async fn datasets_call_each_other_and_block_drops() {
    let ctx = context().await;
    let users = deploy_users(&ctx).await;
    create_user(&ctx, &users, 7, "grace").await;
    let directory = ctx
        .create_dataset(directory_schema(&users), OWNER)
        .await
        .unwrap();

    let rows = ctx
        .call(ExecutionRequest::new(&directory, "lookup", vec![Value::Int(7)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows.rows, vec![vec![Value::from("grace")]]);

    let err = ctx.delete_dataset(&users, OWNER).await.unwrap_err();
    assert!(matches!(err, EngineError::DatasetInUse { ref user, .. } if user == &directory));

    let err = ctx.delete_dataset(&directory, STRANGER).await.unwrap_err();
    assert!(matches!(err, EngineError::NotOwner(_)), "{err}");

    ctx.delete_dataset(&directory, OWNER).await.unwrap();
    ctx.delete_dataset(&users, OWNER).await.unwrap();
    assert!(ctx.list_datasets(None).is_empty());
}

#[tokio::test]
async fn views_may_not_call_writing_procedures_of_other_datasets() {
    let ctx = context().await;
    let users = deploy_users(&ctx).await;
    let schema: Schema = serde_json::from_value(json!({
        "name": "dir",
        "extensions": [{"name": users, "alias": "people"}],
        "procedures": [{
            "name": "peek",
            "public": true,
            "modifiers": ["VIEW"],
            "statements": ["people.create_user(9, 'evil');"]
        }]
    }))
    .unwrap();
    let err = ctx.create_dataset(schema, OWNER).await.unwrap_err();
    assert!(
        matches!(err, EngineError::ReadOnlyProcedureCallsMutative { ref callee, .. } if callee == "people.create_user"),
        "{err}"
    );
    assert_eq!(ctx.list_datasets(None).len(), 1);
    assert!(ctx.query(&users, "SELECT id FROM users").await.unwrap().is_empty());
}

/// Appends rows to `users` without declaring the method as writing, so only
/// the scope guards it.
struct Journal;

struct JournalNamespace;

#[async_trait]
impl ExtensionInitializer for Journal {
    async fn initialize(
        &self,
        _ctx: &DeploymentContext<'_>,
        _config: &HashMap<String, String>,
    ) -> Result<Arc<dyn Namespace>, EngineError> {
        Ok(Arc::new(JournalNamespace))
    }
}

#[async_trait]
impl Namespace for JournalNamespace {
    async fn call(
        &self,
        scope: &mut ScopeContext,
        session: &mut dyn Session,
        _method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError> {
        if !scope.is_mutative() {
            return Err(EngineError::Extension {
                name: "journal".into(),
                message: "append in a read-only scope".into(),
            });
        }
        session
            .execute(scope.dbid(), "INSERT INTO users (id, name) VALUES (?1, ?2)", &args)
            .await?;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn views_run_read_only_under_execute() {
    let config = EngineConfig::default();
    let store: Arc<dyn DatasetStore> = Arc::new(SqliteStore::connect(&config).await.unwrap());
    let mut registry = ExtensionRegistry::with_builtins();
    registry.register("journal", Arc::new(Journal)).unwrap();
    let ctx = GlobalContext::new(Arc::new(registry), store, config).await.unwrap();

    let mut schema = users_schema(json!([
        {
            "name": "record",
            "public": true,
            "statements": ["j.append(1, 'kept');"]
        },
        {
            "name": "peek",
            "public": true,
            "modifiers": ["VIEW"],
            "statements": ["j.append(2, 'evil');"]
        },
        {
            "name": "outer",
            "public": true,
            "modifiers": ["VIEW"],
            "statements": ["peek();"]
        }
    ]));
    schema.extensions.push(ExtensionUsage {
        name: "journal".into(),
        alias: "j".into(),
        config: vec![],
    });
    let dbid = ctx.create_dataset(schema, OWNER).await.unwrap();

    ctx.execute(ExecutionRequest::new(&dbid, "record", vec![]))
        .await
        .unwrap();
    for procedure in ["peek", "outer"] {
        let err = ctx
            .execute(ExecutionRequest::new(&dbid, procedure, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Extension { .. }), "{procedure}: {err}");
    }

    let rows = ctx.query(&dbid, "SELECT id, name FROM users").await.unwrap();
    assert_eq!(rows.rows, vec![vec![Value::Int(1), Value::from("kept")]]);
}

#[tokio::test]
async fn recursion_stops_at_max_call_depth() {
    let ctx = context_with(EngineConfig::default().with_max_call_depth(3)).await;
    let dbid = ctx
        .create_dataset(
            users_schema(json!([{
                "name": "recurse",
                "public": true,
                "statements": ["recurse();"]
            }])),
            OWNER,
        )
        .await
        .unwrap();
    let err = ctx
        .execute(ExecutionRequest::new(&dbid, "recurse", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MaxCallDepth(3)), "{err}");
}

#[tokio::test]
async fn cancelled_requests_do_nothing() {
    let ctx = context().await;
    let dbid = deploy_users(&ctx).await;
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = ctx
        .execute(
            ExecutionRequest::new(&dbid, "create_user", vec![Value::Int(1), Value::from("a")])
                .with_cancel(cancel),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled), "{err}");
    assert!(ctx.query(&dbid, "SELECT id FROM users").await.unwrap().is_empty());
}

#[tokio::test]
async fn environment_and_authentication() {
    let ctx = context().await;
    let dbid = ctx
        .create_dataset(
            users_schema(json!([{
                "name": "whoami",
                "public": true,
                "modifiers": ["VIEW", "AUTHENTICATED"],
                "statements": ["SELECT @caller AS caller;"]
            }])),
            OWNER,
        )
        .await
        .unwrap();

    let err = ctx
        .call(ExecutionRequest::new(&dbid, "whoami", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAuthenticated(_)), "{err}");

    let rows = ctx
        .call(
            ExecutionRequest::new(&dbid, "whoami", vec![])
                .with_signer(STRANGER)
                .with_caller("alice"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows.columns, vec!["caller"]);
    assert_eq!(rows.rows, vec![vec![Value::from("alice")]]);
}

#[tokio::test]
async fn restart_reloads_datasets_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::default().with_database_url(dir.path().to_string_lossy());

    let (users, directory) = {
        let ctx = context_with(config.clone()).await;
        let users = deploy_users(&ctx).await;
        create_user(&ctx, &users, 3, "ada").await;
        let directory = ctx
            .create_dataset(directory_schema(&users), OWNER)
            .await
            .unwrap();
        (users, directory)
    };

    let ctx = context_with(config).await;
    let listed: Vec<String> = ctx
        .list_datasets(Some(OWNER))
        .into_iter()
        .map(|info| info.dbid)
        .collect();
    let mut expected = vec![users.clone(), directory.clone()];
    expected.sort();
    assert_eq!(listed, expected);
    assert!(ctx.list_datasets(Some(STRANGER)).is_empty());

    let rows = ctx
        .call(ExecutionRequest::new(&directory, "lookup", vec![Value::Int(3)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows.rows, vec![vec![Value::from("ada")]]);
    assert_eq!(ctx.get_schema(&users).unwrap().owner, OWNER);
}
