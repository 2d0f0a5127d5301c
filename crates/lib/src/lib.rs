//! stratum-lib: layered filesystem image builds
//!
//! This crate provides the pieces behind the `stratum` CLI:
//! - `recipe`: parsing build recipes into steps
//! - `subst`: `${VAR}` references in instruction arguments
//! - `execute`: running a recipe step by step with layer caching
//! - `layer`: the content-addressed layer store
//! - `manifest`: built images, tags and id resolution
//! - `gc` / `export`: store maintenance and image export

pub mod consts;
pub mod execute;
pub mod export;
pub mod gc;
pub mod layer;
pub mod manifest;
pub mod platform;
pub mod recipe;
pub mod store_lock;
pub mod subst;
pub mod util;
