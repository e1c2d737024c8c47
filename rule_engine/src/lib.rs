// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Access-control predicates. A [`Rule`] is a small AST rather than a
//! closure-over-closure factory, so combinator composition stays
//! allocation-free and introspectable; [`evaluate`] is the single recursive
//! evaluator that walks it against an [`EvalContext`].

use errors::ResolverError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

mod path;
pub use path::{parse_path, Path, PathSegment};

/// A bound for the `count` combinator: `amount` is exclusive of `min`/`max`.
#[derive(Debug, Clone, PartialEq)]
pub struct CountBound {
    pub amount: Option<u64>,
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl CountBound {
    pub fn matches(&self, len: usize) -> bool {
        let len = len as u64;
        if let Some(amount) = self.amount {
            return len == amount;
        }
        let above_min = self.min.map_or(true, |min| len >= min);
        let below_max = self.max.map_or(true, |max| len <= max);
        above_min && below_max
    }
}

/// The closed set of access-rule combinators.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    All,
    None,
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
    Request(Box<Rule>),
    Is(Path),
    Member(Path),
    Count(Path, CountBound),
    IsEqual(Path, Value),
}

impl Rule {
    pub fn and(rules: impl IntoIterator<Item = Rule>) -> Rule {
        Rule::And(rules.into_iter().collect())
    }

    pub fn or(rules: impl IntoIterator<Item = Rule>) -> Rule {
        Rule::Or(rules.into_iter().collect())
    }

    pub fn not(rule: Rule) -> Rule {
        Rule::Not(Box::new(rule))
    }

    pub fn request(rule: Rule) -> Rule {
        Rule::Request(Box::new(rule))
    }

    pub fn is(path: &str) -> Rule {
        Rule::Is(parse_path(path))
    }

    pub fn member(path: &str) -> Rule {
        Rule::Member(parse_path(path))
    }

    pub fn count(path: &str, bound: CountBound) -> Rule {
        Rule::Count(parse_path(path), bound)
    }

    pub fn is_equal(path: &str, value: Value) -> Rule {
        Rule::IsEqual(parse_path(path), value)
    }
}

/// One link in the ancestor chain a sub-request was resolved under. `object`
/// is the row currently being checked (once known), `request` is the raw
/// sub-request that produced it. Owned via `Arc` rather than borrowed so a
/// scope can be cloned and carried across the recursive, `await`-laden
/// Table Resolver pipeline without lifetime parameters leaking into it.
#[derive(Debug, Clone)]
pub struct Scope {
    pub object: Arc<Value>,
    pub request: Arc<Value>,
    pub parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn root(object: Arc<Value>, request: Arc<Value>) -> Scope {
        Scope {
            object,
            request,
            parent: None,
        }
    }

    pub fn child(&self, object: Arc<Value>, request: Arc<Value>) -> Scope {
        Scope {
            object,
            request,
            parent: Some(Arc::new(self.clone())),
        }
    }
}

/// Everything a predicate needs to decide: who is asking, what they asked
/// for, and the row (if any) the predicate runs against.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub auth_id: Value,
    pub is_admin: bool,
    pub scope: Scope,
    pub request_flag: bool,
}

/// Succeeds silently or fails with a reason. `None` is the canonical admin
/// bypass: it always fails unless the caller authenticated with the private
/// key, regardless of `request_flag`.
pub fn evaluate(rule: &Rule, ctx: &EvalContext) -> Result<(), ResolverError> {
    match rule {
        Rule::All => Ok(()),
        Rule::None => {
            if ctx.is_admin {
                Ok(())
            } else {
                Err(ResolverError::forbidden("rule 'none' never admits a non-admin caller"))
            }
        }
        Rule::And(rules) => {
            for rule in rules {
                evaluate(rule, ctx)?;
            }
            Ok(())
        }
        Rule::Or(rules) => {
            let mut last = None;
            for rule in rules {
                match evaluate(rule, ctx) {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e),
                }
            }
            Err(last.unwrap_or_else(|| ResolverError::forbidden("empty 'or' never admits a caller")))
        }
        Rule::Not(inner) => match evaluate(inner, ctx) {
            Ok(()) => Err(ResolverError::forbidden("negated rule was satisfied")),
            Err(_) => Ok(()),
        },
        Rule::Request(inner) => {
            let request_ctx = EvalContext {
                request_flag: true,
                ..ctx.clone()
            };
            evaluate(inner, &request_ctx)
        }
        Rule::Is(path) => {
            let target = resolve(path, ctx)?;
            let row_id = target.get("reservedId").unwrap_or(&target);
            if row_id == &ctx.auth_id {
                Ok(())
            } else {
                Err(ResolverError::forbidden(format!("'{:?}' is not the caller", path)))
            }
        }
        Rule::Member(path) => {
            let target = resolve(path, ctx)?;
            let members = target.as_array().ok_or_else(|| ResolverError::forbidden("member path is not a list"))?;
            let is_member = members
                .iter()
                .any(|member| member.get("reservedId").unwrap_or(member) == &ctx.auth_id);
            if is_member {
                Ok(())
            } else {
                Err(ResolverError::forbidden(format!("caller is not a member of '{:?}'", path)))
            }
        }
        Rule::Count(path, bound) => {
            let target = resolve(path, ctx)?;
            let len = target.as_array().map(|a| a.len()).unwrap_or(0);
            if bound.matches(len) {
                Ok(())
            } else {
                Err(ResolverError::forbidden(format!("'{:?}' has the wrong count", path)))
            }
        }
        Rule::IsEqual(path, expected) => {
            let target = resolve(path, ctx)?;
            if values_equal(&target, expected) {
                Ok(())
            } else {
                Err(ResolverError::forbidden(format!("'{:?}' is not equal to the expected value", path)))
            }
        }
    }
}

fn resolve(path: &Path, ctx: &EvalContext) -> Result<Value, ResolverError> {
    let mut target = if ctx.request_flag { (*ctx.scope.request).clone() } else { (*ctx.scope.object).clone() };
    let mut scope = ctx.scope.clone();
    for segment in path.segments() {
        match segment {
            PathSegment::SelfRow => {}
            PathSegment::Parent => {
                let parent = scope.parent.clone().ok_or_else(|| ResolverError::forbidden("path has no parent"))?;
                target = if ctx.request_flag { (*parent.request).clone() } else { (*parent.object).clone() };
                scope = (*parent).clone();
            }
            PathSegment::Field(name) => {
                target = target
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ResolverError::forbidden(format!("path segment '{}' has no value", name)))?;
            }
        }
    }
    Ok(target)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_timestamp(left), as_timestamp(right)) {
        return l == r;
    }
    left == right
}

fn as_timestamp(value: &Value) -> Option<i64> {
    value
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
}

/// A table's full set of access rules: table-level actions plus
/// per-field read/write and per-array add/remove overrides.
#[derive(Debug, Clone, Default)]
pub struct FieldRules {
    pub read: Option<Rule>,
    pub write: Option<Rule>,
}

#[derive(Debug, Clone, Default)]
pub struct ArrayRules {
    pub add: Option<Rule>,
    pub remove: Option<Rule>,
}

#[derive(Debug, Clone)]
pub struct TableRules {
    pub read: Rule,
    pub write: Rule,
    pub create: Rule,
    pub delete: Rule,
    pub fields: BTreeMap<String, FieldRules>,
    pub arrays: BTreeMap<String, ArrayRules>,
}

impl TableRules {
    /// A table with no explicit rules: every action is open except the
    /// implicit `reservedId` rule, which is always `none`.
    pub fn open() -> TableRules {
        let mut fields = BTreeMap::new();
        fields.insert(
            "reservedId".to_owned(),
            FieldRules {
                read: None,
                write: Some(Rule::None),
            },
        );
        TableRules {
            read: Rule::All,
            write: Rule::All,
            create: Rule::All,
            delete: Rule::All,
            fields,
            arrays: BTreeMap::new(),
        }
    }

    pub fn field_read(&self, field: &str) -> Option<&Rule> {
        self.fields.get(field).and_then(|f| f.read.as_ref())
    }

    pub fn field_write(&self, field: &str) -> Option<&Rule> {
        self.fields.get(field).and_then(|f| f.write.as_ref())
    }

    pub fn array_add(&self, field: &str) -> Option<&Rule> {
        self.arrays.get(field).and_then(|a| a.add.as_ref())
    }

    pub fn array_remove(&self, field: &str) -> Option<&Rule> {
        self.arrays.get(field).and_then(|a| a.remove.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(auth_id: Value, object: Value, request: Value, is_admin: bool) -> EvalContext {
        EvalContext {
            auth_id,
            is_admin,
            scope: Scope::root(Arc::new(object), Arc::new(request)),
            request_flag: false,
        }
    }

    #[test]
    fn all_always_succeeds() {
        assert!(evaluate(&Rule::All, &ctx(json!(1), json!({}), json!({}), false)).is_ok());
    }

    #[test]
    fn none_only_admits_admin() {
        assert!(evaluate(&Rule::None, &ctx(json!(1), json!({}), json!({}), false)).is_err());
        assert!(evaluate(&Rule::None, &ctx(json!(1), json!({}), json!({}), true)).is_ok());
    }

    #[test]
    fn is_self_compares_reserved_id_to_auth_id() {
        assert!(evaluate(&Rule::is("self"), &ctx(json!(42), json!({"reservedId": 42}), json!({}), false)).is_ok());
        assert!(evaluate(&Rule::is("self"), &ctx(json!(42), json!({"reservedId": 7}), json!({}), false)).is_err());
    }

    #[test]
    fn member_checks_auth_id_against_a_list_of_rows() {
        let object = json!({"participants": [{"reservedId": 1}, {"reservedId": 2}]});
        assert!(evaluate(&Rule::member("participants"), &ctx(json!(2), object, json!({}), false)).is_ok());
    }

    #[test]
    fn count_checks_list_length() {
        let object = json!({"participants": [{}, {}]});
        let bound = CountBound {
            amount: Some(2),
            min: None,
            max: None,
        };
        assert!(evaluate(&Rule::count("participants", bound), &ctx(json!(1), object, json!({}), false)).is_ok());
    }

    #[test]
    fn not_inverts_the_inner_rule() {
        let object = json!({"reservedId": 1});
        assert!(evaluate(&Rule::not(Rule::is("self")), &ctx(json!(1), object, json!({}), false)).is_err());
    }

    #[test]
    fn request_flag_targets_the_request_instead_of_the_object() {
        let request = json!({"reservedId": 1});
        assert!(evaluate(&Rule::request(Rule::is("self")), &ctx(json!(1), json!({}), request, false)).is_ok());
    }

    #[test]
    fn or_succeeds_if_any_branch_succeeds() {
        let object = json!({"reservedId": 99});
        let rule = Rule::or([Rule::is("self"), Rule::All]);
        assert!(evaluate(&rule, &ctx(json!(1), object, json!({}), false)).is_ok());
    }
}
