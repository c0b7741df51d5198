mod barrier;
mod command_buffer;
mod context;
mod descriptor;
mod filter;
mod frames;
mod maths;
mod pipeline;
mod primary;
mod profiler;
mod renderer;
mod rtao;
mod samples;
mod scene;
mod swapchain;
pub mod window_surface;

pub mod prelude {
    pub use crate::barrier::*;
    pub use crate::command_buffer::*;
    pub use crate::context::*;
    pub use crate::descriptor::*;
    pub use crate::filter::*;
    pub use crate::frames::*;
    pub use crate::maths::*;
    pub use crate::pipeline::*;
    pub use crate::primary::*;
    pub use crate::profiler::*;
    pub use crate::renderer::*;
    pub use crate::rtao::*;
    pub use crate::samples::*;
    pub use crate::scene::*;
    pub use crate::swapchain::*;
}
