/*!
Listener plumbing for HotTake change feeds.

- [`Broadcast`](broadcast::Broadcast) fans a value out to every registered listener, synchronously
  and in registration order. Listeners are invoked without any broadcast lock held, so a listener
  may register or drop listeners (itself included) while being called.
- [`ListenerGuard`](broadcast::ListenerGuard) and [`SubscriptionGuard`] unregister on drop, or
  earlier through [`Release::release`].
- [`Subscribe`] is the porcelain trait for anything that yields a sequence of values. Closures,
  `std::sync::mpsc::Sender` and (with the `tokio` feature) `tokio::sync::mpsc::UnboundedSender`
  can all be used as listeners.

```rust
use hottake_signals::{broadcast::Broadcast, Release};

let broadcast = Broadcast::new();
let guard = broadcast.listen(|value: u32| println!("got {value}"));
broadcast.send(1); // got 1
guard.release();
broadcast.send(2); // nobody listening
```
*/

pub mod broadcast;
pub mod porcelain;
mod release;

pub use porcelain::subscribe::{DynSubscribe, IntoSubscribeListener, Subscribe, SubscribeListener, SubscriptionGuard};
pub use release::Release;
