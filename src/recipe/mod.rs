// Build recipe generation: script + repository context -> image-build directives.

mod generate;
mod parse;
mod types;

pub use generate::{PRIVILEGED_ENV, SOURCE_DIR, generate};
pub use parse::parse_recipe;
pub use types::{Directive, Recipe, RecipeError};
