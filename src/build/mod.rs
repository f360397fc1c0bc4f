//! Building slugs from pushed source

pub mod builder;
pub mod buildpack;
pub mod procfile;
pub mod source;

pub use builder::{BuildOutput, Builder};
pub use buildpack::{
    Buildpack, BuildpackRegistry, CompileContext, InlineBuildpack, ScriptBuildpack,
    BUILDPACK_URL_VAR, INLINE_BUILDPACK_URL,
};
pub use procfile::ProcessTypes;
pub use source::{AppManifest, SourceTree};
