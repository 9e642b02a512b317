//! Kernel synchronization primitives.
//!
//! Blocking primitives for kernel threads: counting semaphores, sleeping
//! locks with owner tracking, condition variables, and a reader/writer
//! lock with bounded writer wait. All of them park the calling thread on
//! a wait channel instead of spinning; spin locks are used only to guard
//! the primitives' own state for the few instructions it takes to decide
//! whether to sleep.

pub mod condvar;
pub mod lock;
pub mod rwlock;
pub mod semaphore;
pub mod wchan;

pub use condvar::Condvar;
pub use lock::Lock;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use wchan::WaitChannel;
