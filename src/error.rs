use std::io;

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        /// A constructor was given a bad rect, budget, or color count
        InvalidArgument(what: &'static str) {
            display("invalid argument: {}", what)
        }
        /// An operation was attempted in a state that does not allow it
        InvalidState(op: &'static str) {
            display("{} is not allowed in the current state", op)
        }
        CaptureUnavailable {
            display("screen capture is not available on this display")
        }
        /// Both the RAM and the spill budgets are exhausted
        OutOfMemory {
            display("frame cache is full")
        }
        ThreadSend {
            display("internal error; encoder thread aborted unexpectedly")
        }
        Io(err: io::Error) {
            from()
            display("I/O error: {}", err)
            source(err)
        }
    }
}

pub type CatResult<T, E = Error> = Result<T, E>;
