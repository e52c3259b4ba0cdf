//! Sandbox recipe resolution.
//!
//! A recipe is the `.sadguard/Dockerfile` + `.sadguard/wrapper.sh` pair. A
//! repository may ship its own; otherwise the language is detected from
//! marker files and both are rendered from built-in templates.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Relative path of the Dockerfile inside a workspace.
pub const DOCKERFILE_PATH: &str = ".sadguard/Dockerfile";
/// Relative path of the wrapper script inside a workspace.
pub const WRAPPER_PATH: &str = ".sadguard/wrapper.sh";

const DOCKERFILE_TEMPLATE: &str = "\
FROM {base_image}

WORKDIR /app

RUN apt-get update \\
    && apt-get install -y --no-install-recommends tcpdump mitmproxy iproute2 \\
    && rm -rf /var/lib/apt/lists/*

COPY . /app

RUN {install_cmd}

COPY .sadguard/wrapper.sh /wrapper.sh
RUN chmod +x /wrapper.sh

ENV DEFAULT_CMD=\"{test_command}\"

ENTRYPOINT [\"/wrapper.sh\"]
";

const WRAPPER_TEMPLATE: &str = "\
#!/bin/sh
set -u

CMD=\"${DEFAULT_CMD:-{test_command}}\"

ip -s link > /tmp/net-before.txt 2>/dev/null || true
tcpdump -i any -nn -l > /tmp/tcpdump.log 2>/dev/null &
TCPDUMP_PID=$!
mitmdump --set flow_detail=1 -w /tmp/flows > /tmp/mitm.log 2>&1 &
MITM_PID=$!
sleep 2

sh -c \"$CMD\" > /tmp/code-output.log 2> /tmp/code-error.log
EXIT_CODE=$?

sleep 1
kill \"$TCPDUMP_PID\" \"$MITM_PID\" 2>/dev/null || true
ip -s link > /tmp/net-after.txt 2>/dev/null || true

echo \"## Code Output\"
cat /tmp/code-output.log
echo \"## Code Error\"
cat /tmp/code-error.log
echo \"## Mitmproxy Log (HTTP/HTTPS flows)\"
cat /tmp/mitm.log 2>/dev/null || true
echo \"## Tcpdump Log (All network traffic)\"
cat /tmp/tcpdump.log 2>/dev/null || true
echo \"## Network Difference (Initial vs Final)\"
diff /tmp/net-before.txt /tmp/net-after.txt 2>/dev/null || true

exit \"$EXIT_CODE\"
";

/// Detected project language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Node,
    Python,
}

/// Where the recipe in a workspace came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeSource {
    /// Both files were already present in the repository.
    Provided,
    /// Both files were rendered from the built-in templates.
    Generated(Language),
}

/// A resolved sandbox recipe.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub source: RecipeSource,
    pub base_image: String,
    pub install_cmd: String,
    pub test_command: String,
}

/// Resolves the recipe for a cloned workspace.
///
/// User-supplied `.sadguard/` files are used verbatim (the wrapper is made
/// executable); otherwise the language is detected, both templates are
/// rendered into `.sadguard/`, and the wrapper is made executable.
pub fn resolve(workspace: &Path) -> Result<Recipe> {
    let dockerfile = workspace.join(DOCKERFILE_PATH);
    let wrapper = workspace.join(WRAPPER_PATH);

    if dockerfile.is_file() && wrapper.is_file() {
        make_executable(&wrapper)?;
        tracing::debug!(workspace = %workspace.display(), "using repository-provided recipe");
        return Ok(Recipe {
            source: RecipeSource::Provided,
            base_image: String::new(),
            install_cmd: String::new(),
            test_command: String::new(),
        });
    }

    let recipe = detect(workspace);
    let (language, base_image, install_cmd, test_command) = recipe;

    fs::create_dir_all(workspace.join(".sadguard"))?;
    fs::write(&dockerfile, render_dockerfile(&base_image, &install_cmd, &test_command))?;
    fs::write(&wrapper, render_wrapper(&test_command))?;
    make_executable(&wrapper)?;

    tracing::debug!(
        workspace = %workspace.display(),
        language = ?language,
        base_image,
        "generated sandbox recipe"
    );

    Ok(Recipe {
        source: RecipeSource::Generated(language),
        base_image,
        install_cmd,
        test_command,
    })
}

/// File-presence language detection. Ambiguous repositories fall back to
/// Python with pytest.
fn detect(workspace: &Path) -> (Language, String, String, String) {
    if workspace.join("package.json").is_file() {
        let test_command = node_test_script(workspace).unwrap_or_else(|| "npm test".to_string());
        return (
            Language::Node,
            "node:18-bullseye".to_string(),
            "npm install".to_string(),
            test_command,
        );
    }

    let install_cmd = if workspace.join("requirements.txt").is_file() {
        "pip install -r requirements.txt"
    } else if workspace.join("pyproject.toml").is_file() {
        "pip install ."
    } else {
        // Default recipe still installs from requirements if one appears.
        "pip install -r requirements.txt"
    };

    (
        Language::Python,
        "python:3.10-slim".to_string(),
        install_cmd.to_string(),
        "pytest -v tests/test_app.py".to_string(),
    )
}

/// Reads `scripts.test` out of `package.json`, if present.
fn node_test_script(workspace: &Path) -> Option<String> {
    let raw = fs::read_to_string(workspace.join("package.json")).ok()?;
    let pkg: serde_json::Value = serde_json::from_str(&raw).ok()?;
    pkg.get("scripts")?
        .get("test")?
        .as_str()
        .map(|s| s.to_string())
}

fn render_dockerfile(base_image: &str, install_cmd: &str, test_command: &str) -> String {
    DOCKERFILE_TEMPLATE
        .replace("{base_image}", base_image)
        .replace("{install_cmd}", install_cmd)
        .replace("{test_command}", test_command)
}

fn render_wrapper(test_command: &str) -> String {
    WRAPPER_TEMPLATE.replace("{test_command}", test_command)
}

fn make_executable(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}
