use crate::repo::{EnvVars, Repo};
use crate::script::BuildScript;

use super::types::{Directive, Recipe, RecipeError};

/// Environment variable exposing the privilege decision to build steps.
pub const PRIVILEGED_ENV: &str = "DRONE_PRIVILEGED";

/// Build-context path the checked-out source is copied to.
pub const SOURCE_DIR: &str = "src";

/// Generate the build recipe for one build.
///
/// Pure: the same inputs always render byte-identical text. Directives are
/// emitted in a fixed order: `FROM`, `ADD`, `WORKDIR`, the `ENV` block
/// (repository parameters, the privilege variable, then `env`), an optional
/// `USER`, one `RUN` per command, and an optional `ENTRYPOINT`.
///
/// `PRIVILEGED_ENV` is reserved; entries using it in `repo.params` or `env`
/// are dropped so the recipe always reports the real decision.
pub fn generate(repo: &Repo, script: &BuildScript, env: &EnvVars) -> Result<Recipe, RecipeError> {
    if script.image.trim().is_empty() {
        return Err(RecipeError::EmptyImage);
    }
    if script.commands.is_empty() {
        return Err(RecipeError::NoCommands);
    }
    if repo.working_dir.trim().is_empty() {
        return Err(RecipeError::EmptyWorkingDir);
    }

    let mut vars = repo.params.clone();
    vars.remove(PRIVILEGED_ENV);
    vars.insert(PRIVILEGED_ENV, repo.should_run_privileged().to_string());
    for (key, value) in env.iter().filter(|(key, _)| *key != PRIVILEGED_ENV) {
        vars.insert(key, value);
    }

    let mut directives = vec![
        Directive::From(single_line("FROM", &script.image)?),
        Directive::Add {
            src: SOURCE_DIR.to_string(),
            dest: single_line("ADD", &repo.working_dir)?,
        },
        Directive::Workdir(single_line("WORKDIR", &repo.working_dir)?),
    ];

    for (key, value) in vars.iter() {
        if !is_valid_env_key(key) {
            return Err(RecipeError::InvalidEnvKey {
                key: key.to_string(),
            });
        }
        directives.push(Directive::Env {
            key: key.to_string(),
            value: single_line("ENV", value)?,
        });
    }

    if let Some(user) = script.user.as_deref().filter(|u| !u.trim().is_empty()) {
        directives.push(Directive::User(single_line("USER", user)?));
    }

    for command in &script.commands {
        directives.push(Directive::Run(single_line("RUN", command)?));
    }

    if let Some(entrypoint) = script.entrypoint.as_deref().filter(|e| !e.trim().is_empty()) {
        directives.push(Directive::Entrypoint(single_line("ENTRYPOINT", entrypoint)?));
    }

    Ok(Recipe::from_directives(directives))
}

fn single_line(keyword: &'static str, arg: &str) -> Result<String, RecipeError> {
    if arg.contains(['\n', '\r']) {
        return Err(RecipeError::LineBreak {
            keyword,
            arg: arg.to_string(),
        });
    }
    Ok(arg.trim().to_string())
}

fn is_valid_env_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
