// Wire protocol shared by the engine and transport bindings.

pub mod ws;
