// implementation of conduits.
//
// the basic architecture is vaguely inspired by go's runtime channels. it is as such:
//
// conduit handles wrap around Arc<shared state>
//                                 |
//          /----------------------/
//          v
//       shared state: Mutex<lockable state>
//          |
//          |------ it contains a VecDeque<T> buffer, never longer than the capacity.
//          |
//          |------ it contains a "send waiter queue":
//          |
//          |       this is a queue of parked send operations. each waiter holds an Arc to a slot
//          |       containing the element being sent, and an Arc to the token of the operation it
//          |       belongs to. a receiver that finds the buffer empty (or that just made room in
//          |       it) fires the front waiter's token and takes its element. the fact that they
//          |       form a queue is used to achieve fairness. this direct take is what makes
//          |       capacity 0 work without buffering anything.
//          |
//          \------ it contains a "recv waiter queue" of parked receive operations. these hold no
//                  element. a sender that buffers an element, or parks, fires the front waiter's
//                  token as a notification, and the woken receiver retries. a receiver dropped
//                  after being notified passes the notification on to the next one.
//
// a token can only be fired once. a select parks one waiter per case, all sharing one token, so
// whichever counterpart fires it first decides which case happened.
//
// blocking versions of operations are built as a layer on top of the futures, in the polling
// module.
//
// the organization of these modules is as such:
//
//      token<-----------------core: This holds all the lock-protected state and the transfer
//                             ^     logic. It presents an abstraction which is safe and sound,
//                             |     but panicky and inconvenient.
//                             |
//      polling<---------------api: This is a wrapper around core that adapts it into an API that
//                                  is convenient and defensive. The crate re-exports this API
//                                  publically.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod token;
pub(crate) mod polling;
