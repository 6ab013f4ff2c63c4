use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::error::ExecError;

/// Payload fields that carry host file paths.
pub const PATH_FIELDS: &[&str] = &["inputFile", "trainingDataPath", "predictionDataPath", "outputPath"];

/// Maps paths under the host project root onto the container's mount root.
#[derive(Debug, Clone)]
pub struct PathTranslator {
  host_root: PathBuf,
  container_root: String,
}

impl PathTranslator {
  /// A relative host root is resolved against the current directory.
  pub fn new(host_root: impl AsRef<Path>, container_root: impl Into<String>) -> Self {
    let host_root = host_root.as_ref();
    let host_root = std::path::absolute(host_root).unwrap_or_else(|_| host_root.to_path_buf());
    Self {
      host_root: normalize(&host_root),
      container_root: container_root.into().replace('\\', "/"),
    }
  }

  pub fn host_root(&self) -> &Path {
    &self.host_root
  }

  /// Relative paths are taken relative to the host root. Nothing is accepted
  /// when the root could not be made absolute.
  pub fn to_container(&self, host_path: &Path) -> Result<String, ExecError> {
    let outside = || ExecError::PathOutsideRoot {
      path: host_path.display().to_string(),
      root: self.host_root.display().to_string(),
    };
    if !self.host_root.is_absolute() {
      return Err(outside());
    }
    let absolute = if host_path.is_absolute() {
      normalize(host_path)
    } else {
      normalize(&self.host_root.join(host_path))
    };
    let relative = absolute.strip_prefix(&self.host_root).map_err(|_| outside())?;

    let mut translated = self.container_root.trim_end_matches('/').to_string();
    for component in relative.components() {
      translated.push('/');
      translated.push_str(&component.as_os_str().to_string_lossy().replace('\\', "/"));
    }
    if translated.is_empty() {
      translated.push('/');
    }
    Ok(translated)
  }

  /// Rewrites every string-valued [`PATH_FIELDS`] entry of a payload.
  pub fn translate_payload(&self, payload: &Value) -> Result<Value, ExecError> {
    let mut translated = payload.clone();
    if let Some(fields) = translated.as_object_mut() {
      for field in PATH_FIELDS {
        if let Some(Value::String(path)) = fields.get_mut(*field) {
          *path = self.to_container(Path::new(path.as_str()))?;
        }
      }
    }
    Ok(translated)
  }
}

/// Lexically resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
  let mut normalized = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        normalized.pop();
      }
      other => normalized.push(other.as_os_str()),
    }
  }
  normalized
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use serde_json::json;

  fn translator() -> PathTranslator {
    PathTranslator::new("/srv/xenix/", "/app")
  }

  #[test]
  fn rewrites_paths_inside_root() {
    let t = translator();
    assert_eq!(t.to_container(Path::new("/srv/xenix/uploads/x.xlsx")).unwrap(), "/app/uploads/x.xlsx");
    assert_eq!(t.to_container(Path::new("/srv/xenix/./uploads/../data/y.xlsx")).unwrap(), "/app/data/y.xlsx");
    assert_eq!(t.to_container(Path::new("uploads/z.xlsx")).unwrap(), "/app/uploads/z.xlsx");
    assert_eq!(t.to_container(Path::new("/srv/xenix")).unwrap(), "/app");
  }

  #[test]
  fn refuses_paths_outside_root() {
    let t = translator();
    for outside in ["/etc/passwd", "/srv/xenix/../secrets.xlsx", "/srv/xenixevil/a.xlsx", "../x.xlsx"] {
      let err = t.to_container(Path::new(outside)).unwrap_err();
      assert!(matches!(err, ExecError::PathOutsideRoot { .. }), "{}", outside);
      assert!(err.to_string().contains("/srv/xenix"));
    }
  }

  #[test]
  fn translates_only_allow_listed_fields() {
    let payload = json!({
      "trainingDataPath": "/srv/xenix/uploads/train.xlsx",
      "predictionDataPath": "/srv/xenix/uploads/predict.xlsx",
      "outputPath": "/srv/xenix/outputs/out.xlsx",
      "model": "/srv/xenix/not-a-path-field",
      "featureColumns": ["a", "b"],
    });
    let translated = translator().translate_payload(&payload).unwrap();
    assert_eq!(translated["trainingDataPath"], "/app/uploads/train.xlsx");
    assert_eq!(translated["predictionDataPath"], "/app/uploads/predict.xlsx");
    assert_eq!(translated["outputPath"], "/app/outputs/out.xlsx");
    assert_eq!(translated["model"], "/srv/xenix/not-a-path-field");
    assert_eq!(translated["featureColumns"], json!(["a", "b"]));
  }

  #[test]
  fn relative_root_still_confines_paths() {
    let t = PathTranslator::new(".", "/app");
    assert!(t.host_root().is_absolute());
    assert_eq!(t.host_root(), std::env::current_dir().unwrap().as_path());
    assert_eq!(t.to_container(Path::new("uploads/x.xlsx")).unwrap(), "/app/uploads/x.xlsx");
    for outside in ["/etc/passwd", "../x.xlsx"] {
      let err = t.to_container(Path::new(outside)).unwrap_err();
      assert!(matches!(err, ExecError::PathOutsideRoot { .. }), "{}", outside);
    }
  }

  #[test]
  fn empty_root_accepts_nothing() {
    let t = PathTranslator::new("", "/app");
    for path in ["/etc/passwd", "uploads/x.xlsx"] {
      assert!(matches!(t.to_container(Path::new(path)), Err(ExecError::PathOutsideRoot { .. })), "{}", path);
    }
  }

  #[test]
  fn container_root_may_be_filesystem_root() {
    let t = PathTranslator::new("/srv/xenix", "/");
    assert_eq!(t.to_container(Path::new("/srv/xenix/uploads/x.xlsx")).unwrap(), "/uploads/x.xlsx");
  }
}
