use async_trait::async_trait;
use errors::ResolverError;
use memory_driver::InMemoryDriver;
use plugin::{Plugin, PluginContext, PluginDispatcher};
use request_resolver::{EngineConfig, QueryOptions, RequestResolver};
use rule_engine::{ArrayRules, CountBound, Rule, TableRules};
use schema_preparer::{prepare, ColumnSpec, RawField, RawTable};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

fn varchar_field() -> RawField {
    RawField::Column(ColumnSpec::Shorthand("varchar".to_owned()))
}

fn user_schema() -> schema::SchemaModel {
    let mut fields = BTreeMap::new();
    fields.insert("pseudo".to_owned(), varchar_field());
    fields.insert("email".to_owned(), varchar_field());
    fields.insert("password".to_owned(), varchar_field());
    let mut tables = BTreeMap::new();
    tables.insert("User".to_owned(), RawTable { fields, indexes: vec![], not_null: vec![] });
    prepare(tables).expect("schema prepares")
}

fn user_schema_with_unique_email() -> schema::SchemaModel {
    let mut fields = BTreeMap::new();
    fields.insert("pseudo".to_owned(), varchar_field());
    fields.insert("email".to_owned(), varchar_field());
    fields.insert("password".to_owned(), varchar_field());
    let mut tables = BTreeMap::new();
    tables.insert("User".to_owned(), RawTable { fields, indexes: vec!["email/unique".to_owned()], not_null: vec![] });
    prepare(tables).expect("schema prepares")
}

fn run<F: std::future::Future>(future: F) -> F::Output {
    futures_lite::future::block_on(future)
}

fn config() -> EngineConfig {
    EngineConfig {
        private_key: json!("super-secret"),
        query_timeout: Duration::from_secs(5),
        queue_depth: 64,
    }
}

#[test]
fn registers_two_users_under_admin_auth() {
    let schema = Arc::new(user_schema());
    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), TableRules::open());

    let resolver = RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(PluginDispatcher::new()),
        config(),
    );

    let request = json!({
        "User": [
            {"pseudo": "U1", "email": "u1@x", "password": "p", "create": true},
            {"pseudo": "U2", "email": "u2@x", "password": "p", "create": true},
        ]
    });

    let response = run(resolver.resolve(request, json!("super-secret"), json!({}))).unwrap();
    let users = response.get("User").and_then(|v| v.as_array()).expect("User array");
    assert_eq!(users.len(), 2);
    for user in users {
        assert_eq!(user.get("created"), Some(&json!(true)));
        assert!(user.get("reservedId").is_some());
    }
    assert_ne!(users[0].get("reservedId"), users[1].get("reservedId"));
}

#[test]
fn a_non_admin_caller_only_sees_their_own_row() {
    let schema = Arc::new(user_schema());
    let mut user_rules = TableRules::open();
    user_rules.read = Rule::is("self");
    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), user_rules);

    let resolver = RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(PluginDispatcher::new()),
        config(),
    );

    let create = json!({
        "User": [
            {"pseudo": "U1", "email": "u1@x", "password": "p", "create": true},
            {"pseudo": "U2", "email": "u2@x", "password": "p", "create": true},
        ]
    });
    let created = run(resolver.resolve(create, json!("super-secret"), json!({}))).unwrap();
    let users = created.get("User").and_then(|v| v.as_array()).unwrap();
    let u1_id = users[0].get("reservedId").cloned().unwrap();

    let seen = run(resolver.resolve(json!({"User": {"get": "*"}}), u1_id.clone(), json!({}))).unwrap();
    let visible = seen.get("User").and_then(|v| v.as_array()).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].get("reservedId"), Some(&u1_id));
}

#[test]
fn create_is_rejected_on_a_read_only_in_band_query() {
    let schema = Arc::new(user_schema());
    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), TableRules::open());

    let resolver = RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(PluginDispatcher::new()),
        config(),
    );

    let request = json!({"User": {"pseudo": "U1", "email": "u1@x", "password": "p", "create": true}});
    let options = QueryOptions { admin: false, read_only: true };
    let result = run(resolver.query(request, json!(1), json!({}), options));
    assert!(result.is_err());
}

#[test]
fn rejects_a_request_that_is_not_a_json_object() {
    let schema = Arc::new(user_schema());
    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), TableRules::open());

    let resolver = RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(PluginDispatcher::new()),
        config(),
    );

    let result = run(resolver.resolve(json!([1, 2, 3]), json!("super-secret"), json!({})));
    assert!(result.is_err());
}

#[test]
fn duplicate_unique_email_is_rejected() {
    let schema = Arc::new(user_schema_with_unique_email());
    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), TableRules::open());

    let resolver = RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(PluginDispatcher::new()),
        config(),
    );

    let first = json!({"User": {"pseudo": "U1", "email": "dup@x", "password": "p", "create": true}});
    run(resolver.resolve(first, json!("super-secret"), json!({}))).unwrap();

    let second = json!({"User": {"pseudo": "U2", "email": "dup@x", "password": "p", "create": true}});
    let result = run(resolver.resolve(second, json!("super-secret"), json!({})));
    let err = result.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

/// Bridges the reciprocal half of a two-sided `contacts` list: whenever one
/// user adds another, the plugin adds the caller back onto the target's own
/// list, guarded by a `local.reciprocal` flag so the second add doesn't
/// trigger a third.
struct ContactHandshakePlugin {
    resolver: Mutex<Option<Weak<RequestResolver>>>,
}

impl ContactHandshakePlugin {
    fn new() -> ContactHandshakePlugin {
        ContactHandshakePlugin { resolver: Mutex::new(None) }
    }

    fn attach(&self, resolver: &Arc<RequestResolver>) {
        *self.resolver.lock().unwrap() = Some(Arc::downgrade(resolver));
    }
}

#[async_trait]
impl Plugin for ContactHandshakePlugin {
    async fn on_list_update(&self, table: &str, field: &str, change: &Value, ctx: &PluginContext) -> Result<(), ResolverError> {
        if table != "User" || field != "contacts" {
            return Ok(());
        }
        if ctx.local.get("reciprocal") == Some(&json!(true)) {
            return Ok(());
        }
        let owners = match change.get("owners").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => return Ok(()),
        };
        let added = match change.get("added").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => return Ok(()),
        };
        let resolver = match self.resolver.lock().unwrap().as_ref().and_then(Weak::upgrade) {
            Some(resolver) => resolver,
            None => return Ok(()),
        };
        for owner in &owners {
            for target in &added {
                let reciprocal = json!({"User": {"reservedId": target, "contacts": {"add": {"reservedId": owner}}}});
                resolver
                    .query(reciprocal, Value::Null, json!({"reciprocal": true}), QueryOptions { admin: true, read_only: false })
                    .await?;
            }
        }
        Ok(())
    }
}

#[test]
fn array_add_triggers_a_reciprocal_add_through_a_plugin() {
    let mut fields = BTreeMap::new();
    fields.insert("pseudo".to_owned(), varchar_field());
    fields.insert("contacts".to_owned(), RawField::Array("User".to_owned()));
    let mut tables = BTreeMap::new();
    tables.insert("User".to_owned(), RawTable { fields, indexes: vec![], not_null: vec![] });
    let schema = Arc::new(prepare(tables).expect("schema prepares"));

    let mut user_rules = TableRules::open();
    user_rules.arrays.insert("contacts".to_owned(), ArrayRules { add: Some(Rule::is("self")), remove: None });
    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), user_rules);

    let plugin = Arc::new(ContactHandshakePlugin::new());
    let mut dispatcher = PluginDispatcher::new();
    dispatcher.register(plugin.clone());

    let resolver = Arc::new(RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(dispatcher),
        config(),
    ));
    plugin.attach(&resolver);

    let create = json!({
        "User": [
            {"pseudo": "U1", "create": true},
            {"pseudo": "U2", "create": true},
        ]
    });
    let created = run(resolver.resolve(create, json!("super-secret"), json!({}))).unwrap();
    let users = created.get("User").and_then(|v| v.as_array()).unwrap();
    let u1_id = users[0].get("reservedId").cloned().unwrap();
    let u2_id = users[1].get("reservedId").cloned().unwrap();

    let add_request = json!({"User": {"reservedId": u1_id, "contacts": {"add": {"reservedId": u2_id}}}});
    run(resolver.resolve(add_request, u1_id.clone(), json!({}))).unwrap();

    let check = json!({"User": {"reservedId": u2_id, "get": ["contacts"]}});
    let seen = run(resolver.resolve(check, json!("super-secret"), json!({}))).unwrap();
    let u2 = seen.get("User").and_then(|v| v.as_array()).unwrap();
    let contacts = u2[0].get("contacts").and_then(|v| v.as_array()).unwrap();
    assert!(contacts.iter().any(|c| c.get("reservedId") == Some(&u1_id)));
}

#[test]
fn create_rule_enforces_exactly_two_participants() {
    let mut tables = BTreeMap::new();
    let mut user_fields = BTreeMap::new();
    user_fields.insert("pseudo".to_owned(), varchar_field());
    tables.insert("User".to_owned(), RawTable { fields: user_fields, indexes: vec![], not_null: vec![] });

    let mut feed_fields = BTreeMap::new();
    feed_fields.insert("title".to_owned(), varchar_field());
    feed_fields.insert("participants".to_owned(), RawField::Array("User".to_owned()));
    tables.insert("Feed".to_owned(), RawTable { fields: feed_fields, indexes: vec![], not_null: vec![] });

    let schema = Arc::new(prepare(tables).expect("schema prepares"));

    let mut feed_rules = TableRules::open();
    feed_rules.create = Rule::count("participants", CountBound { amount: Some(2), min: None, max: None });
    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), TableRules::open());
    rules.insert("Feed".to_owned(), feed_rules);

    let resolver = RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(PluginDispatcher::new()),
        config(),
    );

    let create_users = json!({
        "User": [
            {"pseudo": "U1", "create": true},
            {"pseudo": "U2", "create": true},
        ]
    });
    let created = run(resolver.resolve(create_users, json!("super-secret"), json!({}))).unwrap();
    let users = created.get("User").and_then(|v| v.as_array()).unwrap();
    let u1_id = users[0].get("reservedId").cloned().unwrap();
    let u2_id = users[1].get("reservedId").cloned().unwrap();

    let good_feed = json!({"Feed": {"title": "launch", "participants": {"reservedId": [u1_id, u2_id]}, "create": true}});
    let created_feed = run(resolver.resolve(good_feed, u1_id.clone(), json!({}))).unwrap();
    assert_eq!(created_feed.get("Feed").and_then(|v| v.as_array()).map(|a| a.len()), Some(1));

    let bad_feed = json!({"Feed": {"title": "too few", "participants": {"reservedId": [u1_id]}, "create": true}});
    let result = run(resolver.resolve(bad_feed, u1_id, json!({})));
    assert!(result.is_err());
}

#[test]
fn read_rule_restricts_rows_to_participants() {
    let mut tables = BTreeMap::new();
    let mut user_fields = BTreeMap::new();
    user_fields.insert("pseudo".to_owned(), varchar_field());
    tables.insert("User".to_owned(), RawTable { fields: user_fields, indexes: vec![], not_null: vec![] });

    let mut comment_fields = BTreeMap::new();
    comment_fields.insert("text".to_owned(), varchar_field());
    comment_fields.insert("participants".to_owned(), RawField::Array("User".to_owned()));
    tables.insert("Comment".to_owned(), RawTable { fields: comment_fields, indexes: vec![], not_null: vec![] });

    let schema = Arc::new(prepare(tables).expect("schema prepares"));

    let mut comment_rules = TableRules::open();
    comment_rules.read = Rule::member("participants");
    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), TableRules::open());
    rules.insert("Comment".to_owned(), comment_rules);

    let resolver = RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(PluginDispatcher::new()),
        config(),
    );

    let create_users = json!({
        "User": [
            {"pseudo": "U1", "create": true},
            {"pseudo": "U2", "create": true},
            {"pseudo": "U3", "create": true},
        ]
    });
    let created = run(resolver.resolve(create_users, json!("super-secret"), json!({}))).unwrap();
    let users = created.get("User").and_then(|v| v.as_array()).unwrap();
    let u1_id = users[0].get("reservedId").cloned().unwrap();
    let u2_id = users[1].get("reservedId").cloned().unwrap();
    let u3_id = users[2].get("reservedId").cloned().unwrap();

    let create_comment = json!({"Comment": {"text": "hi", "participants": {"reservedId": [u1_id, u2_id]}, "create": true}});
    run(resolver.resolve(create_comment, json!("super-secret"), json!({}))).unwrap();

    let as_participant = run(resolver.resolve(json!({"Comment": {"get": ["text", "participants"]}}), u1_id, json!({}))).unwrap();
    let visible = as_participant.get("Comment").and_then(|v| v.as_array()).unwrap();
    assert_eq!(visible.len(), 1);

    let as_stranger = run(resolver.resolve(json!({"Comment": {"get": ["text", "participants"]}}), u3_id, json!({}))).unwrap();
    let invisible = as_stranger.get("Comment").and_then(|v| v.as_array()).unwrap();
    assert!(invisible.is_empty());
}

#[test]
fn deleting_a_user_cascades_through_array_associations() {
    let mut tables = BTreeMap::new();
    let mut user_fields = BTreeMap::new();
    user_fields.insert("pseudo".to_owned(), varchar_field());
    tables.insert("User".to_owned(), RawTable { fields: user_fields, indexes: vec![], not_null: vec![] });

    let mut feed_fields = BTreeMap::new();
    feed_fields.insert("title".to_owned(), varchar_field());
    feed_fields.insert("participants".to_owned(), RawField::Array("User".to_owned()));
    tables.insert("Feed".to_owned(), RawTable { fields: feed_fields, indexes: vec![], not_null: vec![] });

    let schema = Arc::new(prepare(tables).expect("schema prepares"));

    let mut rules = BTreeMap::new();
    rules.insert("User".to_owned(), TableRules::open());
    rules.insert("Feed".to_owned(), TableRules::open());

    let resolver = RequestResolver::new(
        schema,
        Arc::new(rules),
        Arc::new(InMemoryDriver::new()),
        Arc::new(PluginDispatcher::new()),
        config(),
    );

    let create_users = json!({
        "User": [
            {"pseudo": "U1", "create": true},
            {"pseudo": "U2", "create": true},
        ]
    });
    let created = run(resolver.resolve(create_users, json!("super-secret"), json!({}))).unwrap();
    let users = created.get("User").and_then(|v| v.as_array()).unwrap();
    let u1_id = users[0].get("reservedId").cloned().unwrap();
    let u2_id = users[1].get("reservedId").cloned().unwrap();

    let create_feed = json!({"Feed": {"title": "launch", "participants": {"reservedId": [u1_id, u2_id]}, "create": true}});
    run(resolver.resolve(create_feed, json!("super-secret"), json!({}))).unwrap();

    let delete_u2 = json!({"User": {"reservedId": u2_id, "delete": true}});
    run(resolver.resolve(delete_u2, json!("super-secret"), json!({}))).unwrap();

    let check = run(resolver.resolve(json!({"Feed": {"get": ["title", "participants"]}}), json!("super-secret"), json!({}))).unwrap();
    let feeds = check.get("Feed").and_then(|v| v.as_array()).unwrap();
    assert_eq!(feeds.len(), 1);
    let participants = feeds[0].get("participants").and_then(|v| v.as_array()).unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].get("reservedId"), Some(&u1_id));
}
