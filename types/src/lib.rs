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

//! Column type tags and the shorthand grammar used to declare them.

use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// The closed set of column type tags a declared schema may use.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Ord, PartialOrd)]
pub enum ColumnType {
    String,
    Char,
    Varchar,
    Text,
    Binary,
    Varbinary,
    Integer,
    Float,
    Double,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Time,
    Year,
    Json,
}

#[derive(Debug, PartialEq)]
pub struct UnknownColumnType(String);

impl Display for UnknownColumnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unknown column type '{}'", self.0)
    }
}

impl ColumnType {
    pub fn parse(tag: &str) -> Result<ColumnType, UnknownColumnType> {
        match tag {
            "string" => Ok(ColumnType::String),
            "char" => Ok(ColumnType::Char),
            "varchar" => Ok(ColumnType::Varchar),
            "text" => Ok(ColumnType::Text),
            "binary" => Ok(ColumnType::Binary),
            "varbinary" => Ok(ColumnType::Varbinary),
            "integer" => Ok(ColumnType::Integer),
            "float" => Ok(ColumnType::Float),
            "double" => Ok(ColumnType::Double),
            "decimal" => Ok(ColumnType::Decimal),
            "boolean" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "dateTime" => Ok(ColumnType::DateTime),
            "time" => Ok(ColumnType::Time),
            "year" => Ok(ColumnType::Year),
            "json" => Ok(ColumnType::Json),
            other => Err(UnknownColumnType(other.to_owned())),
        }
    }

    /// Does a JSON scalar satisfy this column's type? Used by the validate
    /// phase when checking `create`/`set` values and primitive constraints.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ColumnType::String | ColumnType::Char | ColumnType::Varchar | ColumnType::Text => value.is_string(),
            ColumnType::Binary | ColumnType::Varbinary => value.is_string(),
            ColumnType::Integer | ColumnType::Year => value.is_i64() || value.is_u64(),
            ColumnType::Float | ColumnType::Double | ColumnType::Decimal => value.is_number(),
            ColumnType::Boolean => value.is_boolean(),
            ColumnType::Date | ColumnType::DateTime | ColumnType::Time => value.is_string() || value.is_number(),
            ColumnType::Json => true,
        }
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "string",
            ColumnType::Char => "char",
            ColumnType::Varchar => "varchar",
            ColumnType::Text => "text",
            ColumnType::Binary => "binary",
            ColumnType::Varbinary => "varbinary",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::Decimal => "decimal",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "dateTime",
            ColumnType::Time => "time",
            ColumnType::Year => "year",
            ColumnType::Json => "json",
        };
        write!(f, "{}", name)
    }
}

/// A fully expanded column descriptor, the shape every shorthand is lowered to.
#[derive(Debug, PartialEq, Clone)]
pub struct ColumnDesc {
    pub name: String,
    pub col_type: ColumnType,
    pub length: Option<u64>,
    pub unsigned: bool,
    pub not_null: bool,
    pub default: Option<Value>,
    pub auto_increment: bool,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> ColumnDesc {
        ColumnDesc {
            name: name.into(),
            col_type,
            length: None,
            unsigned: false,
            not_null: false,
            default: None,
            auto_increment: false,
        }
    }

    pub fn unsigned_integer(name: impl Into<String>) -> ColumnDesc {
        ColumnDesc {
            unsigned: true,
            ..ColumnDesc::new(name, ColumnType::Integer)
        }
    }

    pub fn reserved_id() -> ColumnDesc {
        ColumnDesc {
            not_null: true,
            auto_increment: true,
            ..ColumnDesc::unsigned_integer("reservedId")
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct ShorthandError(String);

impl Display for ShorthandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expands the `"type/length"` declaration shorthand into a [`ColumnDesc`].
///
/// `"varchar/255"` becomes a varchar column of length 255; a bare `"integer"`
/// is accepted with no length. Only types that take a length may carry one.
pub fn parse_shorthand(name: &str, shorthand: &str) -> Result<ColumnDesc, ShorthandError> {
    let mut parts = shorthand.splitn(2, '/');
    let tag = parts.next().unwrap_or_default();
    let col_type = ColumnType::parse(tag).map_err(|e| ShorthandError(e.to_string()))?;
    let length = match parts.next() {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| ShorthandError(format!("'{}' is not a valid length for column '{}'", raw, name)))?,
        ),
        None => None,
    };
    if length.is_some() && !matches!(col_type, ColumnType::Char | ColumnType::Varchar | ColumnType::Binary | ColumnType::Varbinary) {
        return Err(ShorthandError(format!(
            "column '{}' of type {} does not accept a length",
            name, col_type
        )));
    }
    Ok(ColumnDesc {
        name: name.to_owned(),
        col_type,
        length,
        unsigned: false,
        not_null: false,
        default: None,
        auto_increment: false,
    })
}
