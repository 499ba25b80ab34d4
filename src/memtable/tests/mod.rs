mod helpers;

mod tests_refcount;
