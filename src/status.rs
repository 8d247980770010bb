use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use crate::checkpoint::{Checkpoint, CheckpointStore, LocalFsCheckpointStorage};
use crate::cli::StatusArgs;

pub async fn run(args: StatusArgs) -> anyhow::Result<()> {
    let path = Path::new(&args.checkpoint);
    let store = CheckpointStore::load(Arc::new(LocalFsCheckpointStorage::new(path))).await;
    print!("{}", render(store.state()));
    Ok(())
}

pub fn render(checkpoint: &Checkpoint) -> String {
    let mut out = String::new();
    if checkpoint.is_empty() {
        out.push_str("checkpoint is empty\n");
        return out;
    }

    for (course, classes) in checkpoint.courses() {
        let marker = if checkpoint.is_course_satisfied(course) {
            " [satisfied]"
        } else {
            ""
        };
        let _ = writeln!(out, "{course}{marker}");
        for (class_id, progress) in classes {
            let total = if progress.total_lessons > 0 {
                progress.total_lessons.to_string()
            } else {
                "?".to_owned()
            };
            let state = if progress.has_errors { "errors" } else { "ok" };
            let visited = progress.last_lesson + 1;
            let overflow = if progress.total_lessons > 0 && visited > progress.total_lessons {
                "  [progress beyond lesson count]"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "  {class_id}  lessons {visited}/{total}  {state}{overflow}"
            );
        }
    }

    let summary = checkpoint.summary();
    let _ = writeln!(
        out,
        "{} course(s), {} satisfied; {} class(es), {} complete, {} with errors",
        summary.courses,
        summary.satisfied_courses,
        summary.classes,
        summary.completed_classes,
        summary.errored_classes
    );
    out
}
