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

//! The resolver's closed error taxonomy. Every error the core can raise is
//! one of the named kinds below; an embedding HTTP layer maps `code()` onto
//! a transport status, the core itself never knows about status codes.

use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResolverErrorKind {
    Required(String),
    NotSettable(String),
    NotUnique(String),
    NotFound(String),
    BadRequest(String),
    PayloadTooLarge(String),
    WrongPassword,
    Unauthorized(String),
    DatabaseError(String),
    Forbidden(String),
    AccessDenied(String),
    WrongValue(String),
    Conflict(String),
    TooManyRequests,
}

/// A structured error raised anywhere in the resolution pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverError {
    kind: ResolverErrorKind,
}

impl ResolverError {
    /// The closed wire name, e.g. `"NOT_FOUND"`, `"ACCESS_DENIED"`.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            ResolverErrorKind::Required(_) => "REQUIRED",
            ResolverErrorKind::NotSettable(_) => "NOT_SETTABLE",
            ResolverErrorKind::NotUnique(_) => "NOT_UNIQUE",
            ResolverErrorKind::NotFound(_) => "NOT_FOUND",
            ResolverErrorKind::BadRequest(_) => "BAD_REQUEST",
            ResolverErrorKind::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ResolverErrorKind::WrongPassword => "WRONG_PASSWORD",
            ResolverErrorKind::Unauthorized(_) => "UNAUTHORIZED",
            ResolverErrorKind::DatabaseError(_) => "DATABASE_ERROR",
            ResolverErrorKind::Forbidden(_) => "FORBIDDEN",
            ResolverErrorKind::AccessDenied(_) => "ACCESS_DENIED",
            ResolverErrorKind::WrongValue(_) => "WRONG_VALUE",
            ResolverErrorKind::Conflict(_) => "CONFLICT",
            ResolverErrorKind::TooManyRequests => "TOO_MANY_REQUESTS",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ResolverErrorKind::NotFound(_))
    }

    /// On which table, if any, this error originated.
    pub fn table(&self) -> Option<&str> {
        match &self.kind {
            ResolverErrorKind::NotFound(t)
            | ResolverErrorKind::AccessDenied(t)
            | ResolverErrorKind::WrongValue(t) => Some(t.as_str()),
            _ => None,
        }
    }

    /// Rewrites a `WRONG_VALUE` raised by the driver during an access-denied
    /// lookup into `ACCESS_DENIED` on the same table.
    pub fn into_access_denied(self) -> ResolverError {
        match self.kind {
            ResolverErrorKind::WrongValue(table) => ResolverError::access_denied(table),
            _ => self,
        }
    }

    pub fn required(field: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::Required(field.into()),
        }
    }

    pub fn not_settable(field: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::NotSettable(field.into()),
        }
    }

    pub fn not_unique(table: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::NotUnique(table.into()),
        }
    }

    pub fn not_found(table: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::NotFound(table.into()),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::BadRequest(reason.into()),
        }
    }

    pub fn payload_too_large(reason: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::PayloadTooLarge(reason.into()),
        }
    }

    pub fn wrong_password() -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::WrongPassword,
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::Unauthorized(reason.into()),
        }
    }

    pub fn database_error(reason: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::DatabaseError(reason.into()),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::Forbidden(reason.into()),
        }
    }

    pub fn access_denied(table: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::AccessDenied(table.into()),
        }
    }

    pub fn wrong_value(table: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::WrongValue(table.into()),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::Conflict(reason.into()),
        }
    }

    pub fn too_many_requests() -> ResolverError {
        ResolverError {
            kind: ResolverErrorKind::TooManyRequests,
        }
    }
}

impl Display for ResolverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ResolverErrorKind::Required(field) => write!(f, "'{}' is required", field),
            ResolverErrorKind::NotSettable(field) => write!(f, "'{}' cannot be set, no matching row", field),
            ResolverErrorKind::NotUnique(table) => write!(f, "more than one row matched in '{}'", table),
            ResolverErrorKind::NotFound(table) => write!(f, "no row found in '{}'", table),
            ResolverErrorKind::BadRequest(reason) => write!(f, "bad request: {}", reason),
            ResolverErrorKind::PayloadTooLarge(reason) => write!(f, "payload too large: {}", reason),
            ResolverErrorKind::WrongPassword => write!(f, "wrong password"),
            ResolverErrorKind::Unauthorized(reason) => write!(f, "unauthorized: {}", reason),
            ResolverErrorKind::DatabaseError(reason) => write!(f, "database error: {}", reason),
            ResolverErrorKind::Forbidden(reason) => write!(f, "forbidden: {}", reason),
            ResolverErrorKind::AccessDenied(table) => write!(f, "access denied on '{}'", table),
            ResolverErrorKind::WrongValue(table) => write!(f, "wrong value for '{}'", table),
            ResolverErrorKind::Conflict(reason) => write!(f, "conflict: {}", reason),
            ResolverErrorKind::TooManyRequests => write!(f, "too many requests"),
        }
    }
}

impl std::error::Error for ResolverError {}
