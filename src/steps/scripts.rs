//! The `build_scripts` step: boilerplate executable wrappers.

use anyhow::{Context, Result};

use crate::pipeline::BuildContext;
use crate::verbose::vprintln;

pub fn build_scripts(ctx: &mut BuildContext) -> Result<()> {
    let script_dir = ctx.pkg.build_base.join("scripts");
    std::fs::create_dir_all(&script_dir)
        .with_context(|| format!("failed to create {}", script_dir.display()))?;

    for script in &ctx.pkg.manifest.scripts {
        let dest = script_dir.join(&script.name);
        let contents = format!("#!/bin/sh\nexec {} \"$@\"\n", script.command);
        std::fs::write(&dest, contents)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
                .with_context(|| format!("failed to chmod {}", dest.display()))?;
        }
        vprintln!("  wrapper {}", dest.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::{MANIFEST_FILE, load_package};
    use crate::environ::EnvCache;
    use crate::pipeline::BuildContext;

    #[test]
    fn wrappers_are_written_executable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"
            [project]
            name = "demo"
            version = "1.0"
            [[scripts]]
            name = "demo"
            command = "demo-main --serve"
        "#,
        )
        .unwrap();
        let pkg = load_package(dir.path(), None).unwrap();
        let mut cache = EnvCache::new("t".into());
        let mut ctx = BuildContext {
            pkg: &pkg,
            cache: &mut cache,
        };
        super::build_scripts(&mut ctx).unwrap();

        let wrapper = pkg.build_base.join("scripts/demo");
        let contents = std::fs::read_to_string(&wrapper).unwrap();
        assert!(contents.contains("exec demo-main --serve \"$@\""));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&wrapper).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
