//! 锁 key 生成器
//!
//! 所有 key 都由调用方显式传入的类型名、操作名与业务值拼接而成，
//! 相同输入在任何进程中都得到相同的 key。

use std::fmt::Display;

/// 锁的作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// 锁住某个类型的某个操作
    Method,
    /// 锁住整个类型
    Class,
    /// 锁住某个操作上的某个业务值
    Value,
    /// 锁住某个操作上的某种对象类型
    Object,
    /// 单笔扣款，按业务编号加锁
    SinglePayment,
}

impl LockScope {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Method => "lock_method_",
            Self::Class => "lock_class_",
            Self::Value => "lock_value_",
            Self::Object => "lock_object_",
            Self::SinglePayment => "lock_singlePayment_",
        }
    }

    pub fn all() -> [LockScope; 5] {
        [
            Self::Method,
            Self::Class,
            Self::Value,
            Self::Object,
            Self::SinglePayment,
        ]
    }
}

/// 锁 key 生成器
pub struct LockKey;

impl LockKey {
    /// `lock_method_<caller_type>_<operation>`
    pub fn method(caller_type: &str, operation: &str) -> String {
        format!("{}{}_{}", LockScope::Method.prefix(), caller_type, operation)
    }

    /// `lock_class_<caller_type>`
    pub fn class(caller_type: &str) -> String {
        format!("{}{}", LockScope::Class.prefix(), caller_type)
    }

    /// `lock_value_<caller_type>_<operation>_<value>`
    pub fn value(caller_type: &str, operation: &str, value: impl Display) -> String {
        format!(
            "{}{}_{}_{}",
            LockScope::Value.prefix(),
            caller_type,
            operation,
            value
        )
    }

    /// `lock_object_<caller_type>_<operation>_<type of obj>`
    ///
    /// 类型名取自 `std::any::type_name`，同一构建产物内稳定；
    /// 跨不同构建共享锁时请用 [`LockKey::object_named`] 显式给出类型名。
    pub fn object<T: ?Sized>(caller_type: &str, operation: &str, _obj: &T) -> String {
        Self::object_named(caller_type, operation, std::any::type_name::<T>())
    }

    /// `lock_object_<caller_type>_<operation>_<type_name>`
    pub fn object_named(caller_type: &str, operation: &str, type_name: &str) -> String {
        format!(
            "{}{}_{}_{}",
            LockScope::Object.prefix(),
            caller_type,
            operation,
            type_name
        )
    }

    /// `lock_singlePayment_<business_id>`，如合同编号
    pub fn single_payment(business_id: &str) -> String {
        format!("{}{}", LockScope::SinglePayment.prefix(), business_id)
    }

    /// 判断 key 属于哪个作用域
    pub fn scope_of(key: &str) -> Option<LockScope> {
        LockScope::all()
            .into_iter()
            .find(|scope| key.starts_with(scope.prefix()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoanContract;

    #[test]
    fn test_method_key() {
        assert_eq!(
            LockKey::method("billing::PaymentService", "settle"),
            "lock_method_billing::PaymentService_settle"
        );
    }

    #[test]
    fn test_class_key() {
        assert_eq!(
            LockKey::class("billing::PaymentService"),
            "lock_class_billing::PaymentService"
        );
    }

    #[test]
    fn test_value_key() {
        assert_eq!(
            LockKey::value("billing::PaymentService", "refund", "ORD-42"),
            "lock_value_billing::PaymentService_refund_ORD-42"
        );
        assert_eq!(
            LockKey::value("billing::PaymentService", "refund", 42),
            "lock_value_billing::PaymentService_refund_42"
        );
    }

    #[test]
    fn test_object_key_uses_type_name() {
        let key = LockKey::object("billing::PaymentService", "settle", &LoanContract);
        assert!(key.starts_with("lock_object_billing::PaymentService_settle_"));
        assert!(key.ends_with("LoanContract"));
        assert_eq!(
            key,
            LockKey::object_named(
                "billing::PaymentService",
                "settle",
                std::any::type_name::<LoanContract>()
            )
        );
    }

    #[test]
    fn test_single_payment_key() {
        assert_eq!(LockKey::single_payment("C123"), "lock_singlePayment_C123");
    }

    #[test]
    fn test_keys_are_deterministic() {
        assert_eq!(
            LockKey::method("svc::A", "run"),
            LockKey::method("svc::A", "run")
        );
        assert_ne!(
            LockKey::method("svc::A", "run"),
            LockKey::method("svc::B", "run")
        );
        assert_ne!(
            LockKey::value("svc::A", "run", "1"),
            LockKey::value("svc::A", "run", "2")
        );
    }

    #[test]
    fn test_scope_of() {
        assert_eq!(
            LockKey::scope_of(&LockKey::single_payment("C1")),
            Some(LockScope::SinglePayment)
        );
        assert_eq!(
            LockKey::scope_of(&LockKey::class("svc::A")),
            Some(LockScope::Class)
        );
        assert_eq!(LockKey::scope_of("user:profile:1"), None);
    }

    #[test]
    fn test_prefixes_are_distinct() {
        let prefixes: Vec<&str> = LockScope::all().iter().map(|s| s.prefix()).collect();
        for (i, a) in prefixes.iter().enumerate() {
            for b in prefixes.iter().skip(i + 1) {
                assert!(!a.starts_with(b) && !b.starts_with(a));
            }
        }
    }
}
