//! Typed facades over stubs.
//!
//! [`remote_interface!`](crate::remote_interface) declares a struct whose
//! async methods call the remote method of the same name under the stub it
//! wraps. Paths stay data-driven at runtime; call sites are type-checked.
//!
//! ```rust,ignore
//! objcall_core::remote_interface! {
//!     /// The remote `math` namespace.
//!     pub struct MathApi {
//!         fn add(a: i64, b: i64) -> i64;
//!         fn describe(card: Instance<Card>) -> String;
//!     }
//! }
//!
//! let math = MathApi::new(remote.call(Duration::from_secs(1)).get("math"));
//! assert_eq!(math.add(2, 3).await?, 5);
//! ```

#[macro_export]
macro_rules! remote_interface {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fn_meta:meta])*
                fn $method:ident($($arg:ident : $arg_ty:ty),* $(,)?) -> $ret:ty;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            stub: $crate::Stub,
        }

        impl $name {
            /// Wrap the stub addressing this interface's namespace.
            pub fn new(stub: $crate::Stub) -> Self {
                Self { stub }
            }

            pub fn stub(&self) -> &$crate::Stub {
                &self.stub
            }

            $(
                $(#[$fn_meta])*
                pub async fn $method(&self, $($arg: $arg_ty),*) -> $crate::Result<$ret> {
                    let params: ::std::vec::Vec<$crate::serde_json::Value> = vec![
                        $(self.stub.encode(&$arg)?),*
                    ];
                    self.stub
                        .get(stringify!($method))
                        .invoke(params)?
                        .value_as::<$ret>()
                        .await
                }
            )*
        }
    };
}
