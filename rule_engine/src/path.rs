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

//! The small path grammar `is`/`member`/`count`/`isEqual` address: `self`,
//! `a.b.c` field walks, and `parent`/`..` to step up the request chain.

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    SelfRow,
    Parent,
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Path(Vec<PathSegment>);

impl Path {
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }
}

pub fn parse_path(path: &str) -> Path {
    let mut segments = Vec::new();
    let mut rest = path;
    while let Some(stripped) = rest.strip_prefix("..") {
        segments.push(PathSegment::Parent);
        rest = stripped.strip_prefix('.').unwrap_or(stripped);
    }
    segments.extend(rest.split('.').filter(|token| !token.is_empty()).map(|token| match token {
        "self" => PathSegment::SelfRow,
        "parent" => PathSegment::Parent,
        field => PathSegment::Field(field.to_owned()),
    }));
    Path(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_self() {
        assert_eq!(parse_path("self").segments(), &[PathSegment::SelfRow]);
    }

    #[test]
    fn parses_dotted_field_walk() {
        assert_eq!(
            parse_path("a.b.c").segments(),
            &[
                PathSegment::Field("a".to_owned()),
                PathSegment::Field("b".to_owned()),
                PathSegment::Field("c".to_owned())
            ]
        );
    }

    #[test]
    fn parses_parent_forms() {
        assert_eq!(parse_path("parent.email").segments()[0], PathSegment::Parent);
        assert_eq!(parse_path("..email").segments()[0], PathSegment::Parent);
    }
}
