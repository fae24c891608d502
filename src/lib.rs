// =============================================================================
// GPU RESOURCE LIFETIME AND STATE-TRANSITION CORE
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  RenderDevice (factory: buffers, textures, fences)              │
// │    └── DeviceContext (immediate + deferred recording)           │
// │          ├── Usage-state tracker (barriers, reconciliation)     │
// │          ├── Map/unmap state machine (one slot per context)     │
// │          └── Dynamic heap (upload pages, per-frame)             │
// │    └── Timeline (queue fence) + deferred-release queue          │
// │          └── Backend (Vulkan or host simulation)                │
// └─────────────────────────────────────────────────────────────────┘
//
// LIFETIME FLOW:
// 1. Contexts record commands that hold strong references to resources
// 2. Flush submits them and publishes a new fence value
// 3. Dropping a resource enqueues its native handle at that value
// 4. Purge destroys handles whose fence value the GPU has reached
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod context;
pub mod desc;
pub mod device;
pub mod dynamic_heap;
pub mod error;
pub mod map_state;
pub mod memory;
pub mod release_queue;
pub mod resource;
pub mod state;
pub mod sync;

pub use backend::{Backend, BackendCaps, Command, HostBackend, RawHandle, TextureSubresource, VulkanBackend};
pub use config::EngineConfig;
pub use context::{CommandList, ContextKind, DeviceContext, MappedSubresource, Mapping};
pub use desc::{BindFlags, BufferDesc, BufferMode, CpuAccess, TextureDesc, TextureDimension, TextureFormat, Usage};
pub use device::{DeviceStats, RenderDevice};
pub use dynamic_heap::{DynamicAllocation, PagePoolStats};
pub use error::{EngineError, Result};
pub use map_state::{MapFlags, MapState, MapType};
pub use resource::{
    Buffer, BufferView, BufferViewDesc, BufferViewType, GpuResource, Texture, TextureView,
    TextureViewDesc, TextureViewType,
};
pub use state::{ResourceState, TransitionMode};
pub use sync::Fence;
