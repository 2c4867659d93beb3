use devhost_core::target::Target;
use devhost_core::{DevhostError, RouteRecord, Settings};

use super::{route_store, state_store};

/// `devhost route add <name> <target>`
pub fn add(settings: &Settings, name: &str, target: &str) -> Result<(), DevhostError> {
    let target = Target::parse(target)?;
    route_store(settings).set(name, target.clone())?;

    // Reconcile the advisory state mirror after the route-file commit;
    // the route file stays the source of truth.
    let mut record = RouteRecord::new(name, target.clone());
    record.domain = settings.domain.clone();
    state_store(settings).set_route_mirror(record)?;

    println!(
        "{} -> {}  (http://{}.{}:{}/)",
        name,
        target.normalize().url(),
        name,
        settings.domain,
        settings.listen.port(),
    );
    Ok(())
}

/// `devhost route remove <name>`
pub fn remove(settings: &Settings, name: &str) -> Result<(), DevhostError> {
    route_store(settings).remove(name)?;
    state_store(settings).remove_route_mirror(name)?;
    println!("removed {name}");
    Ok(())
}

/// `devhost route list [--json]`
pub fn list(settings: &Settings, json: bool) -> Result<(), DevhostError> {
    let map = route_store(settings).load()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }
    if map.is_empty() {
        println!("no routes");
        return Ok(());
    }
    for (name, target) in &map {
        println!(
            "{name:<20} {:<28} http://{name}.{}:{}/",
            target.normalize().url(),
            settings.domain,
            settings.listen.port(),
        );
    }
    Ok(())
}

/// `devhost route get <name>`
pub fn get(settings: &Settings, name: &str) -> Result<(), DevhostError> {
    match route_store(settings).get(name)? {
        Some(target) => {
            println!("{}", target.normalize().url());
            Ok(())
        }
        None => Err(DevhostError::NotFound(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings_in(dir: &tempfile::TempDir) -> Settings {
        let mut s = Settings::default();
        s.state_dir = dir.path().to_path_buf();
        s
    }

    #[test]
    fn add_writes_route_file_and_mirror() {
        let dir = tempdir().unwrap();
        let settings = settings_in(&dir);
        add(&settings, "api", "8000").unwrap();

        let map = route_store(&settings).load().unwrap();
        assert_eq!(map["api"], Target::Port(8000));

        let state = state_store(&settings).read().unwrap();
        assert!(state.routes.contains_key("api"));
        assert_eq!(state.routes["api"].domain, "localhost");
    }

    #[test]
    fn add_rejects_bad_input_with_exit_code_2() {
        let dir = tempdir().unwrap();
        let settings = settings_in(&dir);
        assert_eq!(add(&settings, "Bad Name", "8000").unwrap_err().exit_code(), 2);
        assert_eq!(
            add(&settings, "api", "file:///etc/passwd").unwrap_err().exit_code(),
            2
        );
        assert!(!settings.route_file().exists());
    }

    #[test]
    fn remove_clears_route_and_mirror() {
        let dir = tempdir().unwrap();
        let settings = settings_in(&dir);
        add(&settings, "api", "8000").unwrap();
        remove(&settings, "api").unwrap();

        assert!(route_store(&settings).load().unwrap().is_empty());
        assert!(state_store(&settings).read().unwrap().routes.is_empty());
    }

    #[test]
    fn remove_unknown_is_exit_code_1() {
        let dir = tempdir().unwrap();
        let settings = settings_in(&dir);
        assert_eq!(remove(&settings, "ghost").unwrap_err().exit_code(), 1);
    }

    #[test]
    fn get_prints_normalized_or_fails() {
        let dir = tempdir().unwrap();
        let settings = settings_in(&dir);
        add(&settings, "api", "localhost:3000").unwrap();
        get(&settings, "api").unwrap();
        assert_eq!(get(&settings, "nope").unwrap_err().exit_code(), 1);
    }
}
