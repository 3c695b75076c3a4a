//! Workspace-level checks over the member manifests. The checks live in `tests/`.
