// Filesystem families organization
// Groups related filesystems together for code reuse

pub mod ext;
