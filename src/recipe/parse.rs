use std::str::FromStr;

use super::types::{Directive, EMPTY_VALUE, Recipe, RecipeError};

/// Read recipe text back into directives.
///
/// Blank lines are skipped. `ADD` and `ENV` split their first argument off at
/// the first space; every other keyword takes the rest of the line.
pub fn parse_recipe(raw: &str) -> Result<Recipe, RecipeError> {
    let mut directives = Vec::new();

    for (index, line) in raw.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (keyword, rest) = match trimmed.split_once(' ') {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (trimmed, ""),
        };

        let directive = match keyword {
            "FROM" => Directive::From(one(line_no, "FROM", rest)?),
            "USER" => Directive::User(one(line_no, "USER", rest)?),
            "WORKDIR" => Directive::Workdir(one(line_no, "WORKDIR", rest)?),
            "RUN" => Directive::Run(one(line_no, "RUN", rest)?),
            "ENTRYPOINT" => Directive::Entrypoint(one(line_no, "ENTRYPOINT", rest)?),
            "ADD" => {
                let (src, dest) = two(line_no, "ADD", rest)?;
                Directive::Add { src, dest }
            }
            "ENV" => {
                let (key, value) = two(line_no, "ENV", rest)?;
                let value = if value == EMPTY_VALUE { String::new() } else { value };
                Directive::Env { key, value }
            }
            other => {
                return Err(RecipeError::UnknownKeyword {
                    line: line_no,
                    keyword: other.to_string(),
                });
            }
        };
        directives.push(directive);
    }

    Ok(Recipe::from_directives(directives))
}

impl FromStr for Recipe {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_recipe(s)
    }
}

fn one(line: usize, keyword: &'static str, rest: &str) -> Result<String, RecipeError> {
    if rest.is_empty() {
        return Err(RecipeError::Arity {
            line,
            keyword,
            expected: 1,
        });
    }
    Ok(rest.to_string())
}

fn two(line: usize, keyword: &'static str, rest: &str) -> Result<(String, String), RecipeError> {
    match rest.split_once(' ') {
        Some((first, second)) if !second.trim().is_empty() => {
            Ok((first.to_string(), second.trim().to_string()))
        }
        _ => Err(RecipeError::Arity {
            line,
            keyword,
            expected: 2,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generated_layout() {
        let recipe: Recipe = "FROM some-image\n\
                              ADD src /build\n\
                              WORKDIR /build\n\
                              ENV DRONE_PRIVILEGED false\n\
                              ENV GREETING hello world\n\
                              RUN make test\n"
            .parse()
            .unwrap();

        assert_eq!(recipe.directives().len(), 6);
        assert_eq!(recipe.env("DRONE_PRIVILEGED"), Some("false"));
        assert_eq!(recipe.env("GREETING"), Some("hello world"));
        assert!(recipe.is_written("ADD", &["src", "/build"]));
    }

    #[test]
    fn empty_env_value_reads_back_empty() {
        let recipe = parse_recipe("FROM alpine\nENV EMPTY \"\"\nRUN true\n").unwrap();
        assert_eq!(recipe.env("EMPTY"), Some(""));
        assert_eq!(recipe.render(), "FROM alpine\nENV EMPTY \"\"\nRUN true\n");
    }

    #[test]
    fn skips_blank_lines() {
        let recipe = parse_recipe("\nFROM alpine\n\n   \nRUN true\n").unwrap();
        assert_eq!(recipe.directives().len(), 2);
    }

    #[test]
    fn rejects_unknown_keyword() {
        assert_eq!(
            parse_recipe("FROM alpine\nCOPY . /src\n"),
            Err(RecipeError::UnknownKeyword {
                line: 2,
                keyword: "COPY".into()
            })
        );
    }

    #[test]
    fn enforces_argument_counts() {
        assert_eq!(
            parse_recipe("ENV ONLY_KEY"),
            Err(RecipeError::Arity {
                line: 1,
                keyword: "ENV",
                expected: 2
            })
        );
        assert_eq!(
            parse_recipe("FROM"),
            Err(RecipeError::Arity {
                line: 1,
                keyword: "FROM",
                expected: 1
            })
        );
    }
}
