use std::fmt::Write as _;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir = match std::env::var_os("CARGO_MANIFEST_DIR") {
        Some(value) => PathBuf::from(value),
        None => panic!("CARGO_MANIFEST_DIR is not set for build script"),
    };

    let lua_dir = manifest_dir.join("src").join("lua");
    println!("cargo:rerun-if-changed={}", lua_dir.display());

    let entries = std::fs::read_dir(&lua_dir).unwrap_or_else(|error| {
        panic!(
            "failed to list Lua scripts in '{}': {error}",
            lua_dir.display()
        )
    });

    let mut scripts: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "lua"))
        .collect();
    scripts.sort();

    for script_path in scripts {
        println!("cargo:rerun-if-changed={}", script_path.display());
        validate_lua_script(&script_path);
    }
}

fn validate_lua_script(script_path: &Path) {
    let source = std::fs::read_to_string(script_path).unwrap_or_else(|error| {
        panic!(
            "failed to read Lua script '{}': {error}",
            script_path.display()
        )
    });

    // Redis embeds a Lua 5.1 interpreter.
    let parse_result =
        full_moon::parse_fallible(&source, full_moon::LuaVersion::lua51()).into_result();
    if let Err(errors) = parse_result {
        let mut details = String::new();
        for error in errors {
            let (start, _) = error.range();
            let _ = writeln!(
                details,
                "line {}, col {}: {}",
                start.line(),
                start.character(),
                error.error_message()
            );
        }
        panic!(
            "invalid Lua syntax in '{}':\n{details}",
            script_path.display()
        );
    }
}
